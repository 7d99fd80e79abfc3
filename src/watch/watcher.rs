// src/watch/watcher.rs

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::watch::WatchEvent;
use crate::watch::patterns::WatchProfile;

/// Quiet period before a change is reported.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// Keeps the underlying `RecommendedWatcher` alive. Dropping it stops
/// watching.
pub struct WatcherHandle {
    _inner: RecommendedWatcher,
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle").finish()
    }
}

/// Collapses bursts of changes per target into one trigger.
#[derive(Debug)]
pub struct Debouncer {
    quiet: Duration,
    pending: HashMap<String, Instant>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: HashMap::new(),
        }
    }

    /// Record a change; the target fires once `quiet` passes without another.
    pub fn touch(&mut self, target: &str, now: Instant) {
        self.pending.insert(target.to_string(), now + self.quiet);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Remove and return every target whose deadline has passed, sorted.
    pub fn due(&mut self, now: Instant) -> Vec<String> {
        let mut due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(target, _)| target.clone())
            .collect();
        for target in &due {
            self.pending.remove(target);
        }
        due.sort();
        due
    }
}

/// Watch `root` recursively and send a debounced [`WatchEvent::Changed`]
/// for every profile matching a changed path.
pub fn spawn_watcher(
    root: impl Into<PathBuf>,
    profiles: Vec<WatchProfile>,
    tx: mpsc::Sender<WatchEvent>,
) -> Result<WatcherHandle> {
    let root = root.into();
    let root = root.canonicalize().unwrap_or(root);

    // Bridge from notify's callback thread into the async world.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = event_tx.send(event);
            }
            Err(err) => warn!(error = %err, "file watch error"),
        },
        Config::default(),
    )?;
    watcher.watch(&root, RecursiveMode::Recursive)?;
    info!("file watcher started on {:?}", root);

    tokio::spawn(async move {
        let mut debouncer = Debouncer::new(DEBOUNCE);

        loop {
            let deadline = debouncer.next_deadline();
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    if matches!(event.kind, EventKind::Access(_)) {
                        continue;
                    }
                    for path in &event.paths {
                        let Some(rel) = relative_to(&root, path) else { continue };
                        for profile in profiles.iter().filter(|p| p.matches(&rel)) {
                            debug!(service = profile.target(), path = %rel, "change detected");
                            debouncer.touch(profile.target(), Instant::now());
                        }
                    }
                }

                _ = sleep_until_opt(deadline) => {
                    for target in debouncer.due(Instant::now()) {
                        if tx.send(WatchEvent::Changed { target }).await.is_err() {
                            debug!("watch receiver dropped; stopping watcher loop");
                            return;
                        }
                    }
                }
            }
        }
        debug!("watcher event loop finished");
    });

    Ok(WatcherHandle { _inner: watcher })
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// `path` relative to `root` with forward slashes.
fn relative_to(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
}
