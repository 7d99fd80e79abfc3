// src/watch/mod.rs

//! File watching for `serve --watch` and `test --watch`.
//!
//! This module only turns filesystem changes into per-target triggers. What
//! a trigger means (restart a service, re-run its suite) is decided by the
//! caller.

pub mod patterns;
pub mod watcher;

pub use patterns::{RawWatchSpec, WatchProfile, build_watch_profiles, profiles_for_services};
pub use watcher::{DEBOUNCE, Debouncer, WatcherHandle, spawn_watcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Something under `target`'s watch patterns changed.
    Changed { target: String },
}
