use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::error::ScriptError;
use crate::unit::{ReloadOutcome, ScriptUnit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Dispatching,
    Stopped,
}

impl WatcherState {
    pub fn label(self) -> &'static str {
        match self {
            WatcherState::Idle => "idle",
            WatcherState::Dispatching => "dispatching",
            WatcherState::Stopped => "stopped",
        }
    }
}

/// Reload trigger for one unit. Events are routed here by the dispatcher when the changed file
/// name and directory match the unit's path exactly.
pub struct ReloadWatcher {
    path: PathBuf,
    directory: PathBuf,
    file_name: OsString,
    unit: Arc<ScriptUnit>,
    state: Mutex<WatcherState>,
    dispatched: AtomicUsize,
}

impl ReloadWatcher {
    pub fn new(unit: Arc<ScriptUnit>) -> Arc<Self> {
        let path = unit.path().to_path_buf();
        let directory = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        let file_name = path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
        Arc::new(Self {
            path,
            directory,
            file_name,
            unit,
            state: Mutex::new(WatcherState::Idle),
            dispatched: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn unit(&self) -> &Arc<ScriptUnit> {
        &self.unit
    }

    pub fn state(&self) -> WatcherState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == WatcherState::Stopped
    }

    /// Number of filesystem-triggered dispatches handled so far.
    pub fn dispatch_count(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }

    pub fn matches(&self, changed: &Path) -> bool {
        !self.is_stopped()
            && changed.file_name() == Some(self.file_name.as_os_str())
            && changed.parent() == Some(self.directory.as_path())
    }

    pub fn reload(&self) -> Result<ReloadOutcome, ScriptError> {
        self.unit.reload()
    }

    pub fn stop(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = WatcherState::Stopped;
    }

    /// Handles one debounced change. Returns `None` when the watcher has been stopped.
    pub(crate) fn dispatch(&self) -> Option<Result<ReloadOutcome, ScriptError>> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == WatcherState::Stopped {
                return None;
            }
            *state = WatcherState::Dispatching;
        }
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        let result = self.unit.reload();
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == WatcherState::Dispatching {
                *state = WatcherState::Idle;
            }
        }
        match &result {
            Ok(outcome) => debug!(target: "watch", path = %self.path.display(), ?outcome, "change dispatched"),
            Err(err) => self.unit.context().facade.report(err),
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::SharedBindings;
    use crate::config::EngineConfig;
    use crate::engine::RhaiScriptEngine;
    use crate::facade::RecordingFacade;
    use crate::unit::{HostContext, ScriptCategory};

    fn watcher_for(path: &str) -> Arc<ReloadWatcher> {
        let context = HostContext {
            engine: Arc::new(RhaiScriptEngine::new(&EngineConfig::default())),
            shared: SharedBindings::new(),
            facade: Arc::new(RecordingFacade::new()),
        };
        ReloadWatcher::new(ScriptUnit::new(path, ScriptCategory::Application, context))
    }

    #[test]
    fn matches_only_the_exact_file() {
        let watcher = watcher_for("/scripts/main/app.rhai");
        assert!(watcher.matches(Path::new("/scripts/main/app.rhai")));
        assert!(!watcher.matches(Path::new("/scripts/main/app.rhai.bak")));
        assert!(!watcher.matches(Path::new("/scripts/main/other.rhai")));
        assert!(!watcher.matches(Path::new("/scripts/other/app.rhai")));
    }

    #[test]
    fn stopped_watchers_ignore_events_and_dispatches() {
        let watcher = watcher_for("/scripts/main/app.rhai");
        assert_eq!(watcher.state(), WatcherState::Idle);
        watcher.stop();
        assert!(!watcher.matches(Path::new("/scripts/main/app.rhai")));
        assert!(watcher.dispatch().is_none());
        assert_eq!(watcher.dispatch_count(), 0);
    }

    #[test]
    fn dispatch_returns_to_idle() {
        let watcher = watcher_for("/scripts/main/app.rhai");
        let outcome = watcher.dispatch().expect("dispatched").expect("disarmed reload succeeds");
        assert_eq!(outcome, ReloadOutcome::Disarmed);
        assert_eq!(watcher.state(), WatcherState::Idle);
        assert_eq!(watcher.dispatch_count(), 1);
    }
}
