// src/harness/mod.rs

//! In-process test harness.
//!
//! - `fault.rs`: fault boundary and scope for a run.
//! - `modules.rs`: module registry and the cache guard around a run.
//! - `engine.rs`: the engine seam.
//! - `runner.rs`: composes the above into repeatable runs.
//! - `suite.rs`: TOML suite engine.
//! - `reporter.rs`: console output of run events.

pub mod engine;
pub mod fault;
pub mod modules;
pub mod reporter;
pub mod runner;
pub mod suite;

pub use engine::{
    CaseFailure, EngineContext, EngineEvent, EngineFactory, EngineHandle, EngineRun, RunSummary,
    TestEngine,
};
pub use fault::{Fault, FaultBoundary, FaultOrigin, FaultScope};
pub use modules::{CacheGuard, ModuleId, ModuleRegistry, ModuleSnapshot};
pub use reporter::SpecReporter;
pub use runner::{CompletionLatch, RunEvent, RunOutcome, RunReport, TestRunner};
pub use suite::SuiteEngine;
