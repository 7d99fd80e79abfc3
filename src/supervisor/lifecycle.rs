// src/supervisor/lifecycle.rs

//! Once-only termination of supervised services when the host goes away.
//!
//! A Ctrl-C (or SIGTERM on unix) only *requests* exit; the host then leaves
//! its main loop and the guard's `shutdown` (or its `Drop`, on an error
//! return or panic unwind) sends the termination signals. Whichever path
//! runs first does the work, every later one is a no-op.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::supervisor::ProcessSupervisor;

/// Something that can terminate everything it started.
pub trait Terminate: Send + Sync {
    /// Returns how many processes were signalled.
    fn kill_all(&self) -> usize;
}

impl Terminate for ProcessSupervisor {
    fn kill_all(&self) -> usize {
        ProcessSupervisor::kill_all(self)
    }
}

/// Target for hosts that start no processes and only need interrupt
/// handling.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProcesses;

impl Terminate for NoProcesses {
    fn kill_all(&self) -> usize {
        0
    }
}

pub struct LifecycleGuard {
    target: Arc<dyn Terminate>,
    done: AtomicBool,
    exit_tx: watch::Sender<bool>,
    listener: Option<JoinHandle<()>>,
}

impl LifecycleGuard {
    /// Guard without a signal listener.
    pub fn new(target: Arc<dyn Terminate>) -> Self {
        let (exit_tx, _) = watch::channel(false);
        Self {
            target,
            done: AtomicBool::new(false),
            exit_tx,
            listener: None,
        }
    }

    /// Guard plus a background listener for interrupt signals.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn install(target: Arc<dyn Terminate>) -> Self {
        let mut guard = Self::new(target);
        let tx = guard.exit_tx.clone();
        guard.listener = Some(tokio::spawn(listen_for_interrupts(tx)));
        guard
    }

    /// Programmatic equivalent of Ctrl-C.
    pub fn request_exit(&self) {
        self.exit_tx.send_replace(true);
    }

    pub fn is_exit_requested(&self) -> bool {
        *self.exit_tx.borrow()
    }

    /// Resolves once exit has been requested.
    pub async fn exit_requested(&self) {
        let mut rx = self.exit_tx.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Terminate every supervised process. Only the first call does
    /// anything; it returns how many processes were signalled.
    pub fn shutdown(&self) -> usize {
        if self.done.swap(true, Ordering::SeqCst) {
            debug!("shutdown already performed");
            return 0;
        }
        let killed = self.target.kill_all();
        info!(killed, "cleanup on exit finished");
        killed
    }
}

impl Drop for LifecycleGuard {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

async fn listen_for_interrupts(tx: watch::Sender<bool>) {
    #[cfg(unix)]
    let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(error = %e, "failed to listen for SIGTERM");
            None
        }
    };

    loop {
        #[cfg(unix)]
        let received = {
            let sigterm = async {
                match terminate.as_mut() {
                    Some(stream) => {
                        stream.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                res = signal::ctrl_c() => res,
                _ = sigterm => Ok(()),
            }
        };

        #[cfg(not(unix))]
        let received = signal::ctrl_c().await;

        if let Err(e) = received {
            warn!(error = %e, "failed to listen for Ctrl+C");
            return;
        }

        info!("interrupt received; shutting down");
        tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingTarget {
        calls: AtomicUsize,
    }

    impl Terminate for CountingTarget {
        fn kill_all(&self) -> usize {
            self.calls.fetch_add(1, Ordering::SeqCst);
            2
        }
    }

    #[test]
    fn shutdown_runs_once_across_explicit_call_and_drop() {
        let target = Arc::new(CountingTarget::default());
        let guard = LifecycleGuard::new(target.clone());

        assert_eq!(guard.shutdown(), 2);
        assert_eq!(guard.shutdown(), 0);
        drop(guard);

        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_alone_performs_shutdown() {
        let target = Arc::new(CountingTarget::default());
        drop(LifecycleGuard::new(target.clone()));
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interrupt_only_guard_terminates_nothing() {
        let guard = LifecycleGuard::install(Arc::new(NoProcesses));
        guard.request_exit();
        guard.exit_requested().await;
        assert_eq!(guard.shutdown(), 0);
    }

    #[tokio::test]
    async fn request_exit_wakes_waiter() {
        let target = Arc::new(CountingTarget::default());
        let guard = LifecycleGuard::new(target.clone());
        assert!(!guard.is_exit_requested());

        guard.request_exit();
        guard.exit_requested().await;
        assert!(guard.is_exit_requested());

        // Requesting exit never terminates anything by itself.
        assert_eq!(target.calls.load(Ordering::SeqCst), 0);
    }
}
