// src/harness/fault.rs

//! Structured fault isolation for a test run.
//!
//! The work future and every task spawned through its [`FaultScope`] report
//! panics and errors into one per-run channel. The boundary hands each fault
//! to a callback as it arrives, then waits for the scope's tasks to finish
//! before returning. Nothing escapes to the caller.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Notify, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a fault was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOrigin {
    /// The work future passed to [`FaultBoundary::run`].
    Work,
    /// A task spawned through [`FaultScope::spawn`].
    Task,
}

#[derive(Debug)]
pub enum Fault {
    Panic { message: String, origin: FaultOrigin },
    Error { error: anyhow::Error, origin: FaultOrigin },
}

impl Fault {
    pub fn origin(&self) -> FaultOrigin {
        match self {
            Fault::Panic { origin, .. } | Fault::Error { origin, .. } => *origin,
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Fault::Panic { .. })
    }

    fn from_panic(payload: Box<dyn Any + Send>, origin: FaultOrigin) -> Self {
        Fault::Panic {
            message: panic_message(payload.as_ref()),
            origin,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Panic { message, .. } => write!(f, "panicked: {message}"),
            Fault::Error { error, .. } => write!(f, "{error:#}"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Counts scope tasks still running and keeps their abort handles.
#[derive(Default)]
struct ScopeTasks {
    outstanding: AtomicUsize,
    idle: Notify,
    aborts: Mutex<Vec<AbortHandle>>,
}

impl ScopeTasks {
    fn started(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    fn finished(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn abort_all(&self) {
        let aborts = self.aborts.lock().unwrap_or_else(|e| e.into_inner());
        for handle in aborts.iter() {
            handle.abort();
        }
    }
}

struct TaskFinished(Arc<ScopeTasks>);

impl Drop for TaskFinished {
    fn drop(&mut self) {
        self.0.finished();
    }
}

/// Capability to spawn fault-reporting tasks inside a boundary.
#[derive(Clone)]
pub struct FaultScope {
    tx: mpsc::UnboundedSender<Fault>,
    tasks: Arc<ScopeTasks>,
}

impl FaultScope {
    /// Spawn `fut` on the runtime. A panic or `Err` is reported to the
    /// boundary and the handle yields `None`.
    pub fn spawn<F, T>(&self, fut: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let tx = self.tx.clone();
        self.tasks.started();
        // Moved into the task, so an aborted task still counts as finished.
        let finished = TaskFinished(self.tasks.clone());

        let handle = tokio::spawn(async move {
            let _finished = finished;
            let result = AssertUnwindSafe(fut).catch_unwind().await;
            match result {
                Ok(Ok(value)) => Some(value),
                Ok(Err(error)) => {
                    let _ = tx.send(Fault::Error {
                        error,
                        origin: FaultOrigin::Task,
                    });
                    None
                }
                Err(payload) => {
                    let _ = tx.send(Fault::from_panic(payload, FaultOrigin::Task));
                    None
                }
            }
        });

        self.tasks
            .aborts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle.abort_handle());
        handle
    }

    /// Report an error without spawning anything.
    pub fn report(&self, error: anyhow::Error) {
        let _ = self.tx.send(Fault::Error {
            error,
            origin: FaultOrigin::Work,
        });
    }
}

#[derive(Debug, Clone)]
pub struct FaultBoundary {
    drain_timeout: Duration,
}

impl Default for FaultBoundary {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultBoundary {
    pub fn new() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Run `work` and route every fault raised by it or its scope to
    /// `on_uncaught`.
    ///
    /// Returns `Some(output)` when the work completed and `None` when it
    /// panicked. Returns only after all scope tasks finished, or after the
    /// drain timeout aborted the stragglers.
    pub async fn run<W, Fut, T, U>(&self, work: W, mut on_uncaught: U) -> Option<T>
    where
        W: FnOnce(FaultScope) -> Fut,
        Fut: Future<Output = T>,
        U: FnMut(Fault),
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Fault>();
        let tasks = Arc::new(ScopeTasks::default());
        let scope = FaultScope {
            tx,
            tasks: tasks.clone(),
        };

        // Building the future happens inside the guarded block too.
        let guarded = AssertUnwindSafe(async move { work(scope).await }).catch_unwind();
        let mut work = Some(Box::pin(guarded));
        let mut output = None;

        while let Some(fut) = work.as_mut() {
            tokio::select! {
                // Faults first, so a fault already queued is attributed
                // before the work moves on.
                biased;

                Some(fault) = rx.recv() => on_uncaught(fault),

                result = fut => {
                    work = None;
                    match result {
                        Ok(value) => output = Some(value),
                        Err(payload) => on_uncaught(Fault::from_panic(payload, FaultOrigin::Work)),
                    }
                }
            }
        }

        self.drain(&tasks, &mut rx, &mut on_uncaught).await;
        output
    }

    async fn drain<U: FnMut(Fault)>(
        &self,
        tasks: &ScopeTasks,
        rx: &mut mpsc::UnboundedReceiver<Fault>,
        on_uncaught: &mut U,
    ) {
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        let mut channel_open = true;

        loop {
            let idle = tasks.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if tasks.outstanding() == 0 {
                break;
            }

            tokio::select! {
                biased;

                msg = rx.recv(), if channel_open => match msg {
                    Some(fault) => on_uncaught(fault),
                    None => channel_open = false,
                },

                _ = &mut idle => {}

                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        outstanding = tasks.outstanding(),
                        timeout = ?self.drain_timeout,
                        "scoped tasks still running after drain timeout; aborting them"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        while let Ok(fault) = rx.try_recv() {
            on_uncaught(fault);
        }
        debug!("fault boundary drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn explode() {
        panic!("work exploded");
    }

    #[tokio::test]
    async fn clean_work_returns_output_without_faults() {
        let mut faults = Vec::new();
        let out = FaultBoundary::new()
            .run(|_scope| async { 7 }, |f| faults.push(f.to_string()))
            .await;
        assert_eq!(out, Some(7));
        assert!(faults.is_empty());
    }

    #[tokio::test]
    async fn panicking_work_is_contained() {
        let mut faults = Vec::new();
        let out: Option<()> = FaultBoundary::new()
            .run(
                |_scope| async { explode() },
                |f| faults.push((f.origin(), f.is_panic(), f.to_string())),
            )
            .await;
        assert_eq!(out, None);
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].0, FaultOrigin::Work);
        assert!(faults[0].1);
        assert!(faults[0].2.contains("work exploded"));
    }

    #[tokio::test]
    async fn panic_while_building_future_is_contained() {
        let mut count = 0;
        let out: Option<()> = FaultBoundary::new()
            .run(
                |_scope| -> std::future::Ready<()> { panic!("no future for you") },
                |_| count += 1,
            )
            .await;
        assert_eq!(out, None);
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn late_task_fault_is_drained_after_work_returns() {
        let mut faults = Vec::new();
        let out = FaultBoundary::new()
            .run(
                |scope| async move {
                    scope.spawn(async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err::<(), _>(anyhow::anyhow!("late failure"))
                    });
                    "sync body done"
                },
                |f| faults.push((f.origin(), f.to_string())),
            )
            .await;

        assert_eq!(out, Some("sync body done"));
        assert_eq!(faults, vec![(FaultOrigin::Task, "late failure".to_string())]);
    }

    #[tokio::test]
    async fn stuck_tasks_are_aborted_after_drain_timeout() {
        let mut faults = 0;
        let out = FaultBoundary::new()
            .with_drain_timeout(Duration::from_millis(50))
            .run(
                |scope| async move {
                    scope.spawn(async {
                        std::future::pending::<()>().await;
                        Ok(())
                    })
                },
                |_| faults += 1,
            )
            .await;

        let handle = out.expect("work completed");
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(faults, 0);
    }

    #[tokio::test]
    async fn aborted_tasks_do_not_hold_the_drain() {
        let started = std::time::Instant::now();
        let out = FaultBoundary::new()
            .with_drain_timeout(Duration::from_secs(30))
            .run(
                |scope| async move {
                    let handle = scope.spawn(async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    });
                    handle.abort();
                    handle
                },
                |_| {},
            )
            .await;

        let handle = out.expect("work completed");
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
