use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::unit::ReloadOutcome;
use crate::watcher::ReloadWatcher;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub reloaded: usize,
    pub disarmed: usize,
    pub queued: usize,
    pub failed: Vec<PathBuf>,
}

impl ReloadSummary {
    pub fn attempted(&self) -> usize {
        self.reloaded + self.disarmed + self.queued + self.failed.len()
    }
}

/// Every live watcher, in registration order, at most one per path.
#[derive(Default)]
pub struct ReloadRegistry {
    watchers: Mutex<Vec<Arc<ReloadWatcher>>>,
}

impl ReloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `watcher`. A watcher already registered for the same path is stopped and replaced
    /// in place; it is returned to the caller.
    pub fn register(&self, watcher: Arc<ReloadWatcher>) -> Option<Arc<ReloadWatcher>> {
        let mut watchers = self.lock();
        match watchers.iter().position(|existing| existing.path() == watcher.path()) {
            Some(index) => {
                let previous = std::mem::replace(&mut watchers[index], watcher);
                if !Arc::ptr_eq(&previous, &watchers[index]) {
                    previous.stop();
                }
                Some(previous)
            }
            None => {
                watchers.push(watcher);
                None
            }
        }
    }

    pub fn unregister(&self, path: &Path) -> Option<Arc<ReloadWatcher>> {
        let mut watchers = self.lock();
        let index = watchers.iter().position(|watcher| watcher.path() == path)?;
        let removed = watchers.remove(index);
        removed.stop();
        Some(removed)
    }

    pub fn find_by_path(&self, path: &Path) -> Option<Arc<ReloadWatcher>> {
        self.lock().iter().find(|watcher| watcher.path() == path).cloned()
    }

    /// First live watcher interested in a change to `changed`.
    pub fn match_event(&self, changed: &Path) -> Option<Arc<ReloadWatcher>> {
        self.lock().iter().find(|watcher| watcher.matches(changed)).cloned()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().iter().map(|watcher| watcher.path().to_path_buf()).collect()
    }

    pub fn watchers(&self) -> Vec<Arc<ReloadWatcher>> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn stop_all(&self) {
        for watcher in self.lock().iter() {
            watcher.stop();
        }
    }

    /// Reloads every registered unit in registration order. A failure is reported through the
    /// unit's host facade and does not stop the remaining reloads.
    pub fn reload_all(&self) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        for watcher in self.watchers() {
            match watcher.reload() {
                Ok(ReloadOutcome::Reloaded) => summary.reloaded += 1,
                Ok(ReloadOutcome::Disarmed) => summary.disarmed += 1,
                Ok(ReloadOutcome::Queued) => summary.queued += 1,
                Err(err) => {
                    watcher.unit().context().facade.report(&err);
                    summary.failed.push(watcher.path().to_path_buf());
                }
            }
        }
        summary
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<ReloadWatcher>>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
