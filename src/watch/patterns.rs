// src/watch/patterns.rs

use std::fmt;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::Project;

/// Paths under a service directory that never trigger anything.
pub const DEFAULT_EXCLUDES: &[&str] = &["**/node_modules/**", "**/.git/**", "**/*.log"];

/// Raw pattern specification for one watch target.
#[derive(Debug, Clone)]
pub struct RawWatchSpec {
    pub target: String,
    pub watch: Vec<String>,
    pub exclude: Vec<String>,
}

/// Compiled watch/exclude globs for one target (a service name).
///
/// Patterns are relative to the project root; the watcher passes relative
/// paths like `"services/api/app.js"` into [`matches`](Self::matches).
#[derive(Clone)]
pub struct WatchProfile {
    target: String,
    watch_set: GlobSet,
    exclude_set: Option<GlobSet>,
}

impl fmt::Debug for WatchProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchProfile")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl WatchProfile {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn matches(&self, rel_path: &str) -> bool {
        self.watch_set.is_match(rel_path)
            && !self
                .exclude_set
                .as_ref()
                .is_some_and(|exclude| exclude.is_match(rel_path))
    }
}

pub fn build_watch_profiles(specs: &[RawWatchSpec]) -> Result<Vec<WatchProfile>> {
    specs
        .iter()
        .map(|spec| {
            let watch_set = build_globset(&spec.watch)
                .with_context(|| format!("building watch globset for {}", spec.target))?;
            let exclude_set = if spec.exclude.is_empty() {
                None
            } else {
                Some(
                    build_globset(&spec.exclude)
                        .with_context(|| format!("building exclude globset for {}", spec.target))?,
                )
            };
            Ok(WatchProfile {
                target: spec.target.clone(),
                watch_set,
                exclude_set,
            })
        })
        .collect()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        builder.add(Glob::new(pat).with_context(|| format!("invalid glob pattern: {pat}"))?);
    }
    Ok(builder.build()?)
}

/// One profile per service: everything inside its directory, minus the
/// default excludes.
pub fn profiles_for_services<'a>(
    project: &Project,
    services: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<WatchProfile>> {
    let services_dir = project.file().config.services_dir.trim_end_matches('/');
    let specs: Vec<RawWatchSpec> = services
        .into_iter()
        .map(|name| RawWatchSpec {
            target: name.to_string(),
            watch: vec![format!("{services_dir}/{name}/**")],
            exclude: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
        })
        .collect();
    build_watch_profiles(&specs)
}
