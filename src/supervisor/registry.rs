// src/supervisor/registry.rs

//! Named registry of service processes.
//!
//! The registry only holds bookkeeping (pid, state, exit code). The `Child`
//! itself is owned by the observer task in `process.rs`. Every method is a
//! short synchronous step; callers hold the surrounding `Mutex` for the
//! whole step and never across an `.await`.

use std::collections::BTreeMap;

use crate::supervisor::launch::LaunchSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Running,
    Terminating,
    Exited,
}

impl ServiceState {
    pub fn is_live(self) -> bool {
        !matches!(self, ServiceState::Exited)
    }
}

/// Snapshot of one registry entry handed out to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub pid: Option<u32>,
    pub launch: LaunchSpec,
    pub state: ServiceState,
    /// `None` until exited, and still `None` when killed by a signal.
    pub exit_code: Option<i32>,
    pub generation: u64,
}

impl ServiceInfo {
    pub(crate) fn starting(name: &str, launch: LaunchSpec, generation: u64) -> Self {
        Self {
            name: name.to_string(),
            pid: None,
            launch,
            state: ServiceState::Starting,
            exit_code: None,
            generation,
        }
    }
}

#[derive(Debug)]
struct ServiceEntry {
    info: ServiceInfo,
    /// SIGTERM already sent to this generation.
    signalled: bool,
}

/// A live entry that has just been moved to `Terminating`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminateTarget {
    pub name: String,
    pub pid: Option<u32>,
    pub generation: u64,
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    entries: BTreeMap<String, ServiceEntry>,
    last_generation: u64,
    observers: usize,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_generation(&mut self) -> u64 {
        self.last_generation += 1;
        self.last_generation
    }

    /// Mark the current entry for `name` as terminating if it is live and
    /// has not been signalled yet.
    pub fn begin_terminate(&mut self, name: &str) -> Option<TerminateTarget> {
        let entry = self.entries.get_mut(name)?;
        Self::terminate_entry(name, entry)
    }

    /// Same as [`begin_terminate`](Self::begin_terminate) for every entry.
    pub fn begin_terminate_all(&mut self) -> Vec<TerminateTarget> {
        self.entries
            .iter_mut()
            .filter_map(|(name, entry)| Self::terminate_entry(name, entry))
            .collect()
    }

    fn terminate_entry(name: &str, entry: &mut ServiceEntry) -> Option<TerminateTarget> {
        if !entry.info.state.is_live() || entry.signalled {
            return None;
        }
        entry.signalled = true;
        entry.info.state = ServiceState::Terminating;
        Some(TerminateTarget {
            name: name.to_string(),
            pid: entry.info.pid,
            generation: entry.info.generation,
        })
    }

    /// Insert (or replace) the entry for `info.name`.
    pub fn insert(&mut self, info: ServiceInfo) {
        self.entries.insert(
            info.name.clone(),
            ServiceEntry {
                info,
                signalled: false,
            },
        );
    }

    pub fn mark_running(&mut self, name: &str, generation: u64, pid: Option<u32>) -> bool {
        match self.current_mut(name, generation) {
            Some(entry) => {
                entry.info.pid = pid;
                if entry.info.state == ServiceState::Starting {
                    entry.info.state = ServiceState::Running;
                }
                true
            }
            None => false,
        }
    }

    /// Record an exit. Returns `false` when `generation` has been replaced,
    /// in which case nothing changes.
    pub fn mark_exited(&mut self, name: &str, generation: u64, code: Option<i32>) -> bool {
        match self.current_mut(name, generation) {
            Some(entry) => {
                entry.info.state = ServiceState::Exited;
                entry.info.exit_code = code;
                true
            }
            None => false,
        }
    }

    fn current_mut(&mut self, name: &str, generation: u64) -> Option<&mut ServiceEntry> {
        self.entries
            .get_mut(name)
            .filter(|entry| entry.info.generation == generation)
    }

    pub fn get(&self, name: &str) -> Option<ServiceInfo> {
        self.entries.get(name).map(|entry| entry.info.clone())
    }

    pub fn snapshot(&self) -> Vec<ServiceInfo> {
        self.entries.values().map(|entry| entry.info.clone()).collect()
    }

    pub fn live_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.info.state.is_live())
            .count()
    }

    pub fn observer_started(&mut self) {
        self.observers += 1;
    }

    pub fn observer_finished(&mut self) {
        self.observers = self.observers.saturating_sub(1);
    }

    /// No live entry and no observer still draining output.
    pub fn is_idle(&self) -> bool {
        self.live_count() == 0 && self.observers == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch() -> LaunchSpec {
        LaunchSpec::from_command(&["node".to_string()], None).unwrap()
    }

    fn running(registry: &mut ServiceRegistry, name: &str, pid: u32) -> u64 {
        let generation = registry.next_generation();
        registry.insert(ServiceInfo::starting(name, launch(), generation));
        assert!(registry.mark_running(name, generation, Some(pid)));
        generation
    }

    #[test]
    fn stale_exit_does_not_touch_replacement() {
        let mut registry = ServiceRegistry::new();
        let old = running(&mut registry, "api", 10);

        let target = registry.begin_terminate("api").unwrap();
        assert_eq!(target.pid, Some(10));

        let new = running(&mut registry, "api", 11);
        assert!(new > old);

        assert!(!registry.mark_exited("api", old, Some(143)));
        let info = registry.get("api").unwrap();
        assert_eq!(info.state, ServiceState::Running);
        assert_eq!(info.pid, Some(11));
        assert_eq!(registry.live_count(), 1);
    }

    #[test]
    fn terminate_all_signals_each_live_entry_once() {
        let mut registry = ServiceRegistry::new();
        assert!(registry.begin_terminate_all().is_empty());

        running(&mut registry, "api", 10);
        let scraper = running(&mut registry, "scraper", 20);
        assert!(registry.mark_exited("scraper", scraper, Some(0)));

        let targets = registry.begin_terminate_all();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name, "api");
        assert_eq!(registry.get("api").unwrap().state, ServiceState::Terminating);

        assert!(registry.begin_terminate_all().is_empty());
        assert!(registry.begin_terminate("api").is_none());
    }

    #[test]
    fn idle_requires_observers_to_finish() {
        let mut registry = ServiceRegistry::new();
        assert!(registry.is_idle());

        let generation = running(&mut registry, "api", 10);
        registry.observer_started();
        assert!(!registry.is_idle());

        registry.mark_exited("api", generation, None);
        assert!(!registry.is_idle());

        registry.observer_finished();
        assert!(registry.is_idle());
    }
}
