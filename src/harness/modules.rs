// src/harness/modules.rs

//! Process-wide cache of loaded test modules.
//!
//! Suites and fixtures are loaded once and shared by id for as long as they
//! stay in the registry. A [`CacheGuard`] remembers what was loaded before a
//! run and evicts everything the run added, so the next run re-loads fresh
//! instances while modules loaded before the first run stay untouched.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use tracing::debug;

/// Normalized module key. For file-backed modules this is the canonical
/// path with forward slashes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_path(path: &Path) -> Self {
        Self(path.to_string_lossy().replace('\\', "/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

type Instance = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct ModuleRegistry {
    modules: Mutex<BTreeMap<ModuleId, Instance>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ModuleId, Instance>> {
        self.modules.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the cached instance for `id`, or build it with `init` and
    /// cache it.
    ///
    /// `init` runs without the registry lock held, so it may load other
    /// modules. If two loads race, the first one cached wins.
    pub fn load<T, F>(&self, id: &ModuleId, init: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T>,
    {
        if let Some(existing) = self.get::<T>(id)? {
            return Ok(existing);
        }

        let fresh: Instance = Arc::new(init()?);
        let cached = self.lock().entry(id.clone()).or_insert(fresh).clone();
        debug!(module = %id, "module loaded");
        downcast(id, cached)
    }

    /// Cached instance for `id`, if any. Fails when the cached instance has
    /// a different type.
    pub fn get<T: Any + Send + Sync>(&self, id: &ModuleId) -> Result<Option<Arc<T>>> {
        let cached = self.lock().get(id).cloned();
        cached.map(|instance| downcast(id, instance)).transpose()
    }

    pub fn contains(&self, id: &ModuleId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn snapshot(&self) -> ModuleSnapshot {
        ModuleSnapshot(self.lock().keys().cloned().collect())
    }

    /// Remove `id`. Returns `false` when it was not loaded.
    pub fn evict(&self, id: &ModuleId) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.lock().keys()).finish()
    }
}

fn downcast<T: Any + Send + Sync>(id: &ModuleId, instance: Instance) -> Result<Arc<T>> {
    instance
        .downcast::<T>()
        .map_err(|_| anyhow!("module {id} is already loaded with a different type"))
}

/// Ids present in the registry at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleSnapshot(BTreeSet<ModuleId>);

impl ModuleSnapshot {
    pub fn contains(&self, id: &ModuleId) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleId> {
        self.0.iter()
    }
}

/// Baseline of the registry taken before a run.
///
/// [`evict_new`](Self::evict_new) runs at most once; if nobody calls it,
/// `Drop` does.
pub struct CacheGuard {
    registry: Arc<ModuleRegistry>,
    baseline: ModuleSnapshot,
    done: AtomicBool,
}

impl CacheGuard {
    pub fn capture(registry: Arc<ModuleRegistry>) -> Self {
        let baseline = registry.snapshot();
        Self {
            registry,
            baseline,
            done: AtomicBool::new(false),
        }
    }

    pub fn baseline(&self) -> &ModuleSnapshot {
        &self.baseline
    }

    /// Evict every module loaded since the baseline and return their ids.
    /// Ids that disappeared in the meantime are skipped.
    pub fn evict_new(&self) -> Vec<ModuleId> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }

        let evicted: Vec<ModuleId> = self
            .registry
            .snapshot()
            .iter()
            .filter(|id| !self.baseline.contains(id))
            .filter(|id| self.registry.evict(id))
            .cloned()
            .collect();

        debug!(evicted = evicted.len(), "module cache restored to baseline");
        evicted
    }
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        self.evict_new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn load_caches_until_evicted() {
        let registry = ModuleRegistry::new();
        let id = ModuleId::from("suite.toml");
        let inits = AtomicUsize::new(0);

        let first = registry
            .load(&id, || {
                inits.fetch_add(1, Ordering::SeqCst);
                Ok(String::from("one"))
            })
            .unwrap();
        let second = registry
            .load(&id, || -> Result<String> { panic!("must not reload") })
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(inits.load(Ordering::SeqCst), 1);

        assert!(registry.evict(&id));
        assert!(!registry.evict(&id));
        assert!(!registry.contains(&id));
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let registry = ModuleRegistry::new();
        let id = ModuleId::from("counter");
        registry.load(&id, || Ok(1usize)).unwrap();
        assert!(registry.load(&id, || Ok(String::new())).is_err());
        assert!(registry.get::<String>(&id).is_err());
    }

    #[test]
    fn failed_init_caches_nothing() {
        let registry = ModuleRegistry::new();
        let id = ModuleId::from("broken");
        let result: Result<Arc<u8>> = registry.load(&id, || Err(anyhow!("parse error")));
        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn guard_evicts_only_new_modules_once() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.load(&ModuleId::from("preloaded"), || Ok(0u8)).unwrap();

        let guard = CacheGuard::capture(registry.clone());
        assert_eq!(guard.baseline().len(), 1);
        assert!(guard.baseline().contains(&ModuleId::from("preloaded")));
        registry.load(&ModuleId::from("a"), || Ok(1u8)).unwrap();
        registry.load(&ModuleId::from("b"), || Ok(2u8)).unwrap();
        // Removed by someone else before the guard runs.
        registry.evict(&ModuleId::from("b"));

        assert_eq!(guard.evict_new(), vec![ModuleId::from("a")]);
        assert!(guard.evict_new().is_empty());
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&ModuleId::from("preloaded")));
    }

    #[test]
    fn guard_drop_restores_baseline() {
        let registry = Arc::new(ModuleRegistry::new());
        {
            let guard = CacheGuard::capture(registry.clone());
            assert!(guard.baseline().is_empty());
            registry.load(&ModuleId::from("temp"), || Ok(())).unwrap();
        }
        assert!(registry.is_empty());
    }
}
