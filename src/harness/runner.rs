// src/harness/runner.rs

//! Repeatable in-process test runs.
//!
//! Every call to [`TestRunner::run_tests`] builds a fresh engine, takes a
//! module baseline, runs the engine inside a fault boundary and finally
//! restores the module cache before signalling the end of the run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::harness::engine::{
    CaseFailure, EngineContext, EngineEvent, EngineFactory, EngineHandle, EngineRun, RunSummary,
    TestEngine,
};
use crate::harness::fault::{DEFAULT_DRAIN_TIMEOUT, Fault, FaultBoundary, FaultScope};
use crate::harness::modules::{CacheGuard, ModuleId, ModuleRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Passed,
    Failed,
    /// The run could not complete; carries the top-level failure.
    Aborted(String),
}

impl RunOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, RunOutcome::Passed)
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub summary: RunSummary,
    /// Modules dropped from the cache after the run.
    pub evicted: Vec<ModuleId>,
}

/// What subscribers see of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Engine(EngineEvent),
    /// A fault that no test case could own.
    Uncaught(String),
    /// Always the last event of a run, sent after the module cache was
    /// restored.
    End {
        outcome: RunOutcome,
        summary: RunSummary,
    },
}

/// Fires at most once.
#[derive(Debug, Default)]
pub struct CompletionLatch {
    fired: AtomicBool,
}

impl CompletionLatch {
    /// Returns `true` only for the first caller.
    pub fn fire(&self) -> bool {
        !self.fired.swap(true, Ordering::SeqCst)
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// State of one `run_tests` call. Never reused.
struct TestRun {
    files: Vec<PathBuf>,
    cache: CacheGuard,
    latch: CompletionLatch,
    active: Mutex<Option<Arc<dyn EngineHandle>>>,
    summary: Mutex<Option<RunSummary>>,
    top_level: Mutex<Vec<String>>,
    late: Mutex<Vec<CaseFailure>>,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl TestRun {
    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn set_active(&self, handle: Arc<dyn EngineHandle>) {
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn active(&self) -> Option<Arc<dyn EngineHandle>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Returns `true` when this call completed the run.
    fn complete(&self, summary: RunSummary) -> bool {
        if !self.latch.fire() {
            debug!("duplicate completion ignored");
            return false;
        }
        *self.summary.lock().unwrap_or_else(|e| e.into_inner()) = Some(summary);
        true
    }

    fn engine_event(&self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::End(summary) => self.complete(summary),
            other => {
                self.emit(RunEvent::Engine(other));
                false
            }
        }
    }

    fn uncaught(&self, fault: Fault) {
        let message = fault.to_string();
        warn!(
            origin = ?fault.origin(),
            panic = fault.is_panic(),
            error = %message,
            "uncaught fault during test run"
        );

        if self.latch.is_fired() {
            self.late
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(CaseFailure {
                    test: "<after run>".to_string(),
                    message: message.clone(),
                });
            self.emit(RunEvent::Uncaught(message));
        } else if let Some(handle) = self.active() {
            handle.uncaught(fault);
        } else {
            self.top_level
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(message.clone());
            self.emit(RunEvent::Uncaught(message));
        }
    }

    fn report(&self, evicted: Vec<ModuleId>) -> RunReport {
        let mut summary = self
            .summary
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_default();
        for failure in self.late.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            summary.record_failure(failure.test, failure.message);
        }

        let top_level = self.top_level.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = if !top_level.is_empty() {
            RunOutcome::Aborted(top_level.join("; "))
        } else if !self.latch.is_fired() {
            RunOutcome::Aborted("test run did not complete".to_string())
        } else if summary.failed > 0 {
            RunOutcome::Failed
        } else {
            RunOutcome::Passed
        };

        RunReport {
            outcome,
            summary,
            evicted,
        }
    }
}

pub struct TestRunner {
    modules: Arc<ModuleRegistry>,
    factory: EngineFactory,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
    drain_timeout: Duration,
}

impl TestRunner {
    pub fn new(modules: Arc<ModuleRegistry>, factory: EngineFactory) -> Self {
        Self {
            modules,
            factory,
            events: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Subscribe to the events of every run.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    /// Run the given test files once.
    ///
    /// Never panics or fails: problems end up in the report's outcome.
    pub async fn run_tests(&self, paths: &[PathBuf]) -> RunReport {
        let mut engine = (self.factory)();
        for path in paths {
            engine.add_file(path.clone());
        }

        let run = Arc::new(TestRun {
            files: paths.to_vec(),
            cache: CacheGuard::capture(self.modules.clone()),
            latch: CompletionLatch::default(),
            active: Mutex::new(None),
            summary: Mutex::new(None),
            top_level: Mutex::new(Vec::new()),
            late: Mutex::new(Vec::new()),
            events: self.events.clone(),
        });
        info!(
            files = run.files.len(),
            baseline = run.cache.baseline().len(),
            "test run starting"
        );

        let boundary = FaultBoundary::new().with_drain_timeout(self.drain_timeout);
        let work_run = run.clone();
        let modules = self.modules.clone();
        boundary
            .run(
                move |scope| drive(engine, work_run, modules, scope),
                |fault| run.uncaught(fault),
            )
            .await;

        let evicted = run.cache.evict_new();
        let report = run.report(evicted);
        info!(
            outcome = ?report.outcome,
            passed = report.summary.passed,
            failed = report.summary.failed,
            evicted = report.evicted.len(),
            "test run finished"
        );

        run.emit(RunEvent::End {
            outcome: report.outcome.clone(),
            summary: report.summary.clone(),
        });
        report
    }
}

/// Start the engine and wait for whichever completion signal comes first.
async fn drive(
    engine: Box<dyn TestEngine>,
    run: Arc<TestRun>,
    modules: Arc<ModuleRegistry>,
    scope: FaultScope,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctx = EngineContext {
        modules,
        scope: scope.clone(),
        events: tx,
    };

    let EngineRun { handle, mut done } = match engine.run(ctx) {
        Ok(started) => started,
        Err(err) => {
            scope.report(err.context("test engine failed to start"));
            return;
        }
    };
    run.set_active(handle);

    loop {
        tokio::select! {
            summary = &mut done => {
                run.complete(summary);
                break;
            }
            Some(event) = rx.recv() => {
                if run.engine_event(event) {
                    break;
                }
            }
        }
    }

    while let Ok(event) = rx.try_recv() {
        run.engine_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_fires_once() {
        let latch = CompletionLatch::default();
        assert!(!latch.is_fired());
        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(latch.is_fired());
    }

    struct BrokenEngine;

    impl TestEngine for BrokenEngine {
        fn add_file(&mut self, _path: PathBuf) {}

        fn run(self: Box<Self>, _ctx: EngineContext) -> anyhow::Result<EngineRun> {
            anyhow::bail!("suite file is malformed")
        }
    }

    #[tokio::test]
    async fn engine_start_failure_aborts_run() {
        let modules = Arc::new(ModuleRegistry::new());
        let factory: EngineFactory = Arc::new(|| Box::new(BrokenEngine) as Box<dyn TestEngine>);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = TestRunner::new(modules, factory).with_events(tx);

        let report = runner.run_tests(&[PathBuf::from("a.toml")]).await;
        match &report.outcome {
            RunOutcome::Aborted(reason) => assert!(reason.contains("failed to start")),
            other => panic!("expected Aborted, got {other:?}"),
        }

        let mut ends = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, RunEvent::End { .. }) {
                ends += 1;
            }
        }
        assert_eq!(ends, 1);
    }
}
