// src/harness/engine.rs

//! Seam between the test runner and a concrete test engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::harness::fault::{Fault, FaultScope};
use crate::harness::modules::ModuleRegistry;

/// Progress reported by an engine while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Start { total: usize },
    CaseStarted { name: String },
    CasePassed { name: String, duration: Duration },
    CaseFailed { name: String, message: String },
    End(RunSummary),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseFailure {
    pub test: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub failures: Vec<CaseFailure>,
}

impl RunSummary {
    pub fn record_pass(&mut self) {
        self.passed += 1;
    }

    pub fn record_failure(&mut self, test: impl Into<String>, message: impl Into<String>) {
        self.failed += 1;
        self.failures.push(CaseFailure {
            test: test.into(),
            message: message.into(),
        });
    }
}

/// What the engine gets to work with for one run.
pub struct EngineContext {
    pub modules: Arc<ModuleRegistry>,
    /// Spawn background work here so its faults are caught.
    pub scope: FaultScope,
    pub events: mpsc::UnboundedSender<EngineEvent>,
}

/// Handle to a started run.
pub trait EngineHandle: Send + Sync {
    /// An uncaught fault happened while this run was active. The engine
    /// attributes it to the case in progress, if any.
    fn uncaught(&self, fault: Fault);
}

pub struct EngineRun {
    pub handle: Arc<dyn EngineHandle>,
    /// Resolves with the summary once every case finished.
    pub done: BoxFuture<'static, RunSummary>,
}

pub trait TestEngine: Send {
    fn add_file(&mut self, path: PathBuf);

    /// Start the run. Loading happens synchronously here; an `Err` means
    /// nothing was started.
    fn run(self: Box<Self>, ctx: EngineContext) -> anyhow::Result<EngineRun>;
}

/// Builds a fresh engine for every run.
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn TestEngine> + Send + Sync>;
