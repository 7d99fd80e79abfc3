use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use devherd::harness::{
    EngineContext, EngineEvent, EngineFactory, EngineHandle, EngineRun, Fault, ModuleId,
    RunSummary, TestEngine,
};

/// Id of the module that [`Step::Count`] loads.
pub const COUNTER_MODULE: &str = "fixtures/counter";

/// Module with mutable state, used to observe cache resets between runs.
#[derive(Default)]
pub struct Counter(AtomicUsize);

/// One scripted test case.
#[derive(Debug, Clone)]
pub enum Step {
    Pass(String),
    Fail(String, String),
    /// Load [`COUNTER_MODULE`], bump it and record the new value.
    Count(String),
    /// The body returns at once but leaves a scoped task that panics after
    /// `delay`; the case stays open for `linger` so the fault lands in it.
    PanicLater {
        name: String,
        delay: Duration,
        linger: Duration,
    },
    /// Leave a scoped task that panics after `delay` and finish right away,
    /// so the fault arrives once the run is over.
    PanicAfterRun { name: String, delay: Duration },
}

/// What a scripted engine observed, shared across runs.
#[derive(Clone, Default)]
pub struct EngineProbe {
    counter_values: Arc<Mutex<Vec<usize>>>,
    files: Arc<Mutex<Vec<Vec<PathBuf>>>>,
    attributed: Arc<Mutex<Vec<(Option<String>, String)>>>,
}

impl EngineProbe {
    pub fn counter_values(&self) -> Vec<usize> {
        self.counter_values.lock().unwrap().clone()
    }

    /// Files added to each engine, one entry per run.
    pub fn files(&self) -> Vec<Vec<PathBuf>> {
        self.files.lock().unwrap().clone()
    }

    /// Faults handed to the engine, with the case that was running.
    pub fn attributed(&self) -> Vec<(Option<String>, String)> {
        self.attributed.lock().unwrap().clone()
    }
}

/// Programmable stand-in for a real test engine.
pub struct ScriptedEngine {
    steps: Vec<Step>,
    start_error: Option<String>,
    files: Vec<PathBuf>,
    probe: EngineProbe,
}

impl ScriptedEngine {
    pub fn factory(steps: Vec<Step>, probe: EngineProbe) -> EngineFactory {
        Arc::new(move || {
            Box::new(ScriptedEngine {
                steps: steps.clone(),
                start_error: None,
                files: Vec::new(),
                probe: probe.clone(),
            }) as Box<dyn TestEngine>
        })
    }

    /// Engine whose `run` fails, like a suite that does not parse.
    pub fn failing_factory(message: &str) -> EngineFactory {
        let message = message.to_string();
        Arc::new(move || {
            Box::new(ScriptedEngine {
                steps: Vec::new(),
                start_error: Some(message.clone()),
                files: Vec::new(),
                probe: EngineProbe::default(),
            }) as Box<dyn TestEngine>
        })
    }
}

#[derive(Default)]
struct ScriptedHandle {
    current: Mutex<Option<String>>,
    pending: Mutex<Vec<String>>,
    summary: Mutex<RunSummary>,
    attributed: Arc<Mutex<Vec<(Option<String>, String)>>>,
}

impl EngineHandle for ScriptedHandle {
    fn uncaught(&self, fault: Fault) {
        let current = self.current.lock().unwrap().clone();
        self.attributed
            .lock()
            .unwrap()
            .push((current.clone(), fault.to_string()));
        match current {
            Some(_) => self.pending.lock().unwrap().push(fault.to_string()),
            None => self
                .summary
                .lock()
                .unwrap()
                .record_failure("<uncaught>", fault.to_string()),
        }
    }
}

fn step_name(step: &Step) -> &str {
    match step {
        Step::Pass(name) | Step::Fail(name, _) | Step::Count(name) => name.as_str(),
        Step::PanicLater { name, .. } | Step::PanicAfterRun { name, .. } => name.as_str(),
    }
}

fn panic_after(delay: Duration, message: String) -> impl Future<Output = anyhow::Result<()>> {
    async move {
        tokio::time::sleep(delay).await;
        if !message.is_empty() {
            panic!("{message}");
        }
        Ok(())
    }
}

impl TestEngine for ScriptedEngine {
    fn add_file(&mut self, path: PathBuf) {
        self.files.push(path);
    }

    fn run(self: Box<Self>, ctx: EngineContext) -> anyhow::Result<EngineRun> {
        if let Some(message) = &self.start_error {
            anyhow::bail!("{message}");
        }
        self.probe.files.lock().unwrap().push(self.files.clone());

        let handle = Arc::new(ScriptedHandle {
            attributed: self.probe.attributed.clone(),
            ..Default::default()
        });
        let state = handle.clone();
        let EngineContext {
            modules,
            scope,
            events,
        } = ctx;
        let steps = self.steps;
        let probe = self.probe;

        let done = Box::pin(async move {
            let _ = events.send(EngineEvent::Start { total: steps.len() });

            for step in &steps {
                let name = step_name(step).to_string();
                *state.current.lock().unwrap() = Some(name.clone());
                let _ = events.send(EngineEvent::CaseStarted { name: name.clone() });

                let mut result: Result<(), String> = Ok(());
                match step {
                    Step::Pass(_) => {}
                    Step::Fail(_, message) => result = Err(message.clone()),
                    Step::Count(_) => {
                        let id = ModuleId::from(COUNTER_MODULE);
                        match modules.load(&id, || Ok(Counter::default())) {
                            Ok(counter) => {
                                let value = counter.0.fetch_add(1, Ordering::SeqCst) + 1;
                                probe.counter_values.lock().unwrap().push(value);
                            }
                            Err(e) => result = Err(e.to_string()),
                        }
                    }
                    Step::PanicLater { delay, linger, .. } => {
                        scope.spawn(panic_after(*delay, format!("async boom in {name}")));
                        tokio::time::sleep(*linger).await;
                    }
                    Step::PanicAfterRun { delay, .. } => {
                        scope.spawn(panic_after(*delay, format!("late boom in {name}")));
                    }
                }

                tokio::task::yield_now().await;
                *state.current.lock().unwrap() = None;
                let faults = std::mem::take(&mut *state.pending.lock().unwrap());
                if result.is_ok() && !faults.is_empty() {
                    result = Err(faults.join("; "));
                }

                match result {
                    Ok(()) => {
                        state.summary.lock().unwrap().record_pass();
                        let _ = events.send(EngineEvent::CasePassed {
                            name,
                            duration: Duration::ZERO,
                        });
                    }
                    Err(message) => {
                        state.summary.lock().unwrap().record_failure(&name, &message);
                        let _ = events.send(EngineEvent::CaseFailed { name, message });
                    }
                }
            }

            let summary = state.summary.lock().unwrap().clone();
            let _ = events.send(EngineEvent::End(summary.clone()));
            summary
        });

        Ok(EngineRun { handle, done })
    }
}
