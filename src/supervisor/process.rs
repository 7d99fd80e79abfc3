// src/supervisor/process.rs

//! Per-process observer and termination signal.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::output::{Channel, consume_bytes};
use crate::supervisor::Shared;

const READ_BUF: usize = 8 * 1024;

/// Send SIGTERM to `pid`. Failures (e.g. the process is already gone) are
/// logged and reported as `false`.
#[cfg(unix)]
pub(crate) fn send_terminate(name: &str, pid: u32) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(service = %name, pid, "pid out of range; not signalling");
        return false;
    };

    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => {
            debug!(service = %name, pid, "sent SIGTERM");
            true
        }
        Err(errno) => {
            warn!(service = %name, pid, error = %errno, "failed to signal process");
            false
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn send_terminate(name: &str, pid: u32) -> bool {
    warn!(service = %name, pid, "graceful termination is only supported on unix");
    false
}

/// Drive one child process until it has exited and both output streams
/// are closed.
///
/// Stdout and stderr readers push raw chunks into a single channel; this
/// task turns them into records for the sink while it waits for the exit
/// status. The exit line is emitted when the process exits, the close line
/// once the exit was seen and both streams reached EOF.
pub(crate) async fn observe(shared: Arc<Shared>, name: String, generation: u64, mut child: Child) {
    let (tx, mut rx) = mpsc::channel::<(Channel, Vec<u8>)>(64);

    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, Channel::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, Channel::Stderr, tx.clone());
    }
    drop(tx);

    let mut streams_open = true;
    let mut exit: Option<Option<i32>> = None;

    let wait = child.wait();
    tokio::pin!(wait);

    while streams_open || exit.is_none() {
        tokio::select! {
            chunk = rx.recv(), if streams_open => match chunk {
                Some((channel, bytes)) => {
                    for record in consume_bytes(&bytes, &name, channel) {
                        shared.sink.record(&record);
                    }
                }
                None => streams_open = false,
            },

            status = &mut wait, if exit.is_none() => {
                let code = match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!(
                            service = %name,
                            generation,
                            error = %e,
                            "failed to wait for process"
                        );
                        None
                    }
                };

                info!(service = %name, generation, exit_code = ?code, "service process exited");
                shared.record_exit(&name, generation, code);
                shared
                    .sink
                    .lifecycle(&name, &format!("End of process with exit code {}", describe(code)));
                exit = Some(code);
            }
        }
    }

    let code = exit.flatten();
    shared
        .sink
        .lifecycle(&name, &format!("Done with exit code {}", describe(code)));
    shared.observer_finished(&name, generation);
}

fn spawn_reader<R>(mut reader: R, channel: Channel, tx: mpsc::Sender<(Channel, Vec<u8>)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send((channel, buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(%channel, error = %e, "output stream read failed");
                    break;
                }
            }
        }
    });
}

/// Exit codes print as numbers; a signal death has none.
fn describe(code: Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}
