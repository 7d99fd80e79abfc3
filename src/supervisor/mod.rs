// src/supervisor/mod.rs

//! Service process supervision.
//!
//! - `registry.rs`: named bookkeeping, one live entry per name.
//! - `launch.rs`: what to start and how.
//! - `process.rs`: output streaming, exit and close notifications.
//! - `lifecycle.rs`: once-only termination of everything on shutdown.

pub mod launch;
pub mod lifecycle;
pub mod process;
pub mod registry;

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{error, info};

use crate::errors::DevherdError;
use crate::output::LogSink;

pub use launch::{LaunchSpec, parse_port};
pub use lifecycle::{LifecycleGuard, NoProcesses, Terminate};
pub use registry::{ServiceInfo, ServiceRegistry, ServiceState};

/// State shared between the supervisor handle and observer tasks.
pub(crate) struct Shared {
    registry: Mutex<ServiceRegistry>,
    pub(crate) sink: Arc<dyn LogSink>,
    /// Bumped after every change that can affect `is_idle`.
    changed: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ServiceRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self) {
        self.changed.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub(crate) fn record_exit(&self, name: &str, generation: u64, code: Option<i32>) {
        let applied = self.lock().mark_exited(name, generation, code);
        if !applied {
            tracing::debug!(service = %name, generation, "exit of replaced process ignored");
        }
        self.notify();
    }

    pub(crate) fn observer_finished(&self, name: &str, generation: u64) {
        self.lock().observer_finished();
        tracing::debug!(service = %name, generation, "observer finished");
        self.notify();
    }
}

/// Handle to the set of supervised services. Cheap to clone.
///
/// `spawn` must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(ServiceRegistry::new()),
                sink,
                changed,
            }),
        }
    }

    /// Start `name`, terminating the previous instance first if one is live.
    ///
    /// The old process is signalled but not awaited. A failure to start is
    /// recorded as an exited entry with code `-1`, never returned as an
    /// error.
    pub fn spawn(&self, name: &str, launch: LaunchSpec) -> ServiceInfo {
        let info = {
            let mut registry = self.shared.lock();

            if let Some(previous) = registry.begin_terminate(name) {
                info!(
                    service = %name,
                    generation = previous.generation,
                    "restarting; terminating previous instance"
                );
                if let Some(pid) = previous.pid {
                    process::send_terminate(name, pid);
                }
            }

            let generation = registry.next_generation();
            let mut info = ServiceInfo::starting(name, launch, generation);
            registry.insert(info.clone());

            match info.launch.command().spawn() {
                Ok(child) => {
                    info.pid = child.id();
                    info.state = ServiceState::Running;
                    registry.mark_running(name, generation, info.pid);
                    registry.observer_started();

                    info!(
                        service = %name,
                        generation,
                        pid = ?info.pid,
                        cmd = %info.launch.display(),
                        "service started"
                    );

                    tokio::spawn(process::observe(
                        self.shared.clone(),
                        name.to_string(),
                        generation,
                        child,
                    ));
                }
                Err(source) => {
                    let err = DevherdError::SpawnFailed {
                        service: name.to_string(),
                        source,
                    };
                    error!(service = %name, generation, error = %err, "service failed to start");
                    self.shared.sink.lifecycle(name, &err.to_string());

                    info.state = ServiceState::Exited;
                    info.exit_code = Some(-1);
                    registry.mark_exited(name, generation, info.exit_code);
                }
            }

            info
        };

        self.shared.notify();
        info
    }

    /// Send SIGTERM to every live service not signalled yet.
    ///
    /// Returns how many were signalled. Safe to call repeatedly and on an
    /// empty registry.
    pub fn kill_all(&self) -> usize {
        let targets = {
            let mut registry = self.shared.lock();
            let targets = registry.begin_terminate_all();
            for target in &targets {
                if let Some(pid) = target.pid {
                    process::send_terminate(&target.name, pid);
                }
                info!(
                    service = %target.name,
                    generation = target.generation,
                    "Nicely killed process: {}",
                    target.name
                );
            }
            targets
        };

        self.shared.notify();
        targets.len()
    }

    pub fn get(&self, name: &str) -> Option<ServiceInfo> {
        self.shared.lock().get(name)
    }

    pub fn services(&self) -> Vec<ServiceInfo> {
        self.shared.lock().snapshot()
    }

    pub fn live_count(&self) -> usize {
        self.shared.lock().live_count()
    }

    /// Resolve once no service is live and all output has been drained.
    pub async fn wait_idle(&self) {
        let mut changed = self.shared.changed.subscribe();
        loop {
            if self.shared.lock().is_idle() {
                return;
            }
            if changed.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("services", &self.services())
            .finish()
    }
}
