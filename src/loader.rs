use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;
use walkdir::WalkDir;

use crate::api::{AddonHandle, RegistrationHandle};
use crate::bindings::{BindingValue, SharedBindings};
use crate::config::HostConfig;
use crate::dispatch::{normalize_watch_path, WatchDispatcher};
use crate::engine::{RhaiScriptEngine, ScriptEngine};
use crate::error::{ScriptError, ScriptErrorKind};
use crate::facade::HostFacade;
use crate::registry::{ReloadRegistry, ReloadSummary};
use crate::unit::{HostContext, ScriptCategory, ScriptUnit};
use crate::watcher::ReloadWatcher;

pub const CONFIG_BINDING: &str = "config";
pub const REGISTRATION_BINDING: &str = "registration";
pub const ADDON_BINDING: &str = "addon";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
    pub path: PathBuf,
    pub kind: ScriptErrorKind,
    pub message: String,
}

/// Outcome of one registration cycle.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub loaded: usize,
    pub classes: usize,
    pub libraries: usize,
    pub applications: usize,
    pub failures: Vec<LoadFailure>,
    pub elapsed: Duration,
}

impl LoadReport {
    pub fn failures_of(&self, kind: ScriptErrorKind) -> Vec<&LoadFailure> {
        self.failures.iter().filter(|failure| failure.kind == kind).collect()
    }

    fn record_success(&mut self, category: ScriptCategory) {
        self.loaded += 1;
        match category {
            ScriptCategory::Class => self.classes += 1,
            ScriptCategory::Library => self.libraries += 1,
            ScriptCategory::Application => self.applications += 1,
        }
    }

    fn record_failure(&mut self, err: &ScriptError) {
        self.failures.push(LoadFailure {
            path: err.path().to_path_buf(),
            kind: err.kind(),
            message: err.to_string(),
        });
    }
}

/// Owns the binding environment, every loaded unit, the reload registry and the watch dispatcher
/// for one addon.
pub struct ScriptLoader {
    config: HostConfig,
    context: HostContext,
    registry: Arc<ReloadRegistry>,
    dispatcher: Option<WatchDispatcher>,
    units: Mutex<BTreeMap<PathBuf, Arc<ScriptUnit>>>,
    registration: RegistrationHandle,
}

impl ScriptLoader {
    pub fn new(config: HostConfig, facade: Arc<dyn HostFacade>) -> Self {
        let engine = Arc::new(RhaiScriptEngine::new(&config.engine));
        Self::with_engine(config, engine, facade)
    }

    pub fn with_engine(config: HostConfig, engine: Arc<dyn ScriptEngine>, facade: Arc<dyn HostFacade>) -> Self {
        let registry = Arc::new(ReloadRegistry::new());
        let dispatcher = if config.watch.enabled {
            match WatchDispatcher::start(Arc::clone(&registry), &config.watch) {
                Ok(dispatcher) => Some(dispatcher),
                Err(err) => {
                    facade.warn(&format!("File watching disabled: {err:#}"));
                    None
                }
            }
        } else {
            None
        };
        let registration = RegistrationHandle::new(&config.addon_name);
        let context = HostContext { engine, shared: SharedBindings::new(), facade };
        let loader =
            Self { config, context, registry, dispatcher, units: Mutex::new(BTreeMap::new()), registration };
        loader.seed_bindings();
        loader
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn shared(&self) -> &SharedBindings {
        &self.context.shared
    }

    pub fn environment(&self) -> &HostContext {
        &self.context
    }

    pub fn registry(&self) -> &Arc<ReloadRegistry> {
        &self.registry
    }

    pub fn registration(&self) -> &RegistrationHandle {
        &self.registration
    }

    pub fn is_watching(&self) -> bool {
        self.dispatcher.as_ref().is_some_and(WatchDispatcher::is_running)
    }

    /// Runs one registration cycle: class, library, then application scripts. A failing file is
    /// reported and skipped; nothing already loaded is rolled back.
    pub fn register(&self) -> LoadReport {
        let started = Instant::now();
        let cycle = self.registration.begin_cycle();
        self.seed_bindings();
        let mut report = LoadReport::default();

        for category in ScriptCategory::ORDER {
            let root = self.config.directory_for(category).to_path_buf();
            for path in self.collect_scripts(&root, &mut report) {
                match self.load_file(&path, category) {
                    Ok(_) => {
                        report.record_success(category);
                        self.registration.record_loaded();
                    }
                    Err(err) => {
                        self.context.facade.report(&err);
                        report.record_failure(&err);
                    }
                }
            }
        }

        report.elapsed = started.elapsed();
        self.context
            .facade
            .info(&format!("Loaded {} scripts in {} milliseconds.", report.loaded, report.elapsed.as_millis()));
        debug!(cycle, failures = report.failures.len(), "registration cycle finished");
        report
    }

    /// Loads or replaces a single script outside a registration cycle.
    pub fn load_script(
        &self,
        path: impl AsRef<Path>,
        category: ScriptCategory,
    ) -> Result<Arc<ScriptUnit>, ScriptError> {
        let path = path.as_ref();
        if path.is_dir() {
            let err = ScriptError::DirectoryNotScript { path: path.to_path_buf() };
            self.context.facade.report(&err);
            return Err(err);
        }
        self.load_file(path, category).map_err(|err| {
            self.context.facade.report(&err);
            err
        })
    }

    /// Permanently unloads the unit at `path`: hooks run and its watcher is deregistered.
    pub fn unload_script(&self, path: impl AsRef<Path>) -> Option<Arc<ScriptUnit>> {
        let path = normalize_watch_path(path.as_ref());
        let unit = self.lock_units().remove(&path)?;
        self.detach(&path);
        let hooks = unit.retire();
        debug!(path = %path.display(), hooks, "unloaded script");
        Some(unit)
    }

    pub fn reload_all(&self) -> ReloadSummary {
        self.registry.reload_all()
    }

    pub fn unit(&self, path: impl AsRef<Path>) -> Option<Arc<ScriptUnit>> {
        let path = normalize_watch_path(path.as_ref());
        self.lock_units().get(&path).cloned()
    }

    /// Every tracked unit in category order, then path order.
    pub fn units(&self) -> Vec<Arc<ScriptUnit>> {
        let mut units: Vec<Arc<ScriptUnit>> = self.lock_units().values().cloned().collect();
        units.sort_by_key(|unit| unit.category());
        units
    }

    /// Stops file watching and runs every unit's unload hooks.
    pub fn shutdown(&self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.shutdown();
        }
        self.registry.stop_all();
        let units: Vec<Arc<ScriptUnit>> = std::mem::take(&mut *self.lock_units()).into_values().collect();
        for unit in units {
            unit.retire();
        }
    }

    fn seed_bindings(&self) {
        let shared = &self.context.shared;
        shared.insert(CONFIG_BINDING, self.config.binding_map());
        shared.insert(REGISTRATION_BINDING, BindingValue::from_handle(self.registration.clone()));
        shared.insert(
            ADDON_BINDING,
            BindingValue::from_handle(AddonHandle::new(
                Arc::clone(&self.context.facade),
                self.registration.clone(),
            )),
        );
    }

    /// Candidate files below `root`, depth first in file-name order. Directories are recorded as
    /// failures but still descended into.
    pub fn collect_scripts(&self, root: &Path, report: &mut LoadReport) -> Vec<PathBuf> {
        if !root.exists() {
            if let Err(source) = fs::create_dir_all(root) {
                let err = ScriptError::FileAccess { path: root.to_path_buf(), source };
                self.context.facade.report(&err);
                report.record_failure(&err);
                return Vec::new();
            }
        }
        let mut scripts = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().unwrap_or(root).to_path_buf();
                    let err = ScriptError::FileAccess { path, source: err.into() };
                    self.context.facade.report(&err);
                    report.record_failure(&err);
                    continue;
                }
            };
            match self.validate(entry.path()) {
                Ok(true) => scripts.push(entry.into_path()),
                Ok(false) => debug!(path = %entry.path().display(), "skipping non-script file"),
                Err(err) => {
                    self.context.facade.report(&err);
                    report.record_failure(&err);
                }
            }
        }
        scripts
    }

    /// `Ok(true)` for a loadable script, `Ok(false)` for a silently excluded file.
    pub fn validate(&self, path: &Path) -> Result<bool, ScriptError> {
        if path.is_dir() {
            return Err(ScriptError::DirectoryNotScript { path: path.to_path_buf() });
        }
        let extension = path.extension().and_then(|ext| ext.to_str());
        let extension_matches = extension == Some(self.config.extension.as_str());
        if !extension_matches {
            return Ok(false);
        }
        let disabled = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(self.config.disabled_prefix.as_str()));
        Ok(!disabled)
    }

    fn load_file(&self, path: &Path, category: ScriptCategory) -> Result<Arc<ScriptUnit>, ScriptError> {
        let path = normalize_watch_path(path);
        let previous = self.lock_units().remove(&path);
        if let Some(previous) = previous {
            self.detach(&path);
            previous.retire();
        }

        let unit = ScriptUnit::new(path.clone(), category, self.context.clone());
        unit.set_auto_reload(self.config.auto_reload);
        let loaded = unit.load();
        // Failed units stay tracked and watched so fixing the file brings them back.
        self.lock_units().insert(path, Arc::clone(&unit));
        self.attach(&unit);
        loaded.map(|()| unit)
    }

    fn attach(&self, unit: &Arc<ScriptUnit>) {
        let watcher = ReloadWatcher::new(Arc::clone(unit));
        match &self.dispatcher {
            Some(dispatcher) if dispatcher.is_running() => {
                if let Err(err) = dispatcher.attach(watcher) {
                    self.context.facade.report(&err);
                }
            }
            _ => {
                self.registry.register(watcher);
            }
        }
    }

    fn detach(&self, path: &Path) {
        match &self.dispatcher {
            Some(dispatcher) => {
                dispatcher.detach(path);
            }
            None => {
                self.registry.unregister(path);
            }
        }
    }

    fn lock_units(&self) -> MutexGuard<'_, BTreeMap<PathBuf, Arc<ScriptUnit>>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ScriptLoader {
    fn drop(&mut self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::{DiagnosticLevel, RecordingFacade};
    use tempfile::TempDir;

    fn loader(dir: &TempDir) -> (ScriptLoader, Arc<RecordingFacade>) {
        let mut config = HostConfig::rooted(dir.path());
        config.watch.enabled = false;
        let facade = Arc::new(RecordingFacade::new());
        (ScriptLoader::new(config, facade.clone()), facade)
    }

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        fs::create_dir_all(dir).expect("create dir");
        let path = dir.join(name);
        fs::write(&path, body).expect("write script");
        path
    }

    #[test]
    fn validate_excludes_other_extensions_and_disabled_files() {
        let dir = TempDir::new().expect("temp dir");
        let (loader, _) = loader(&dir);
        let root = dir.path().join("scripts/main");
        let active = write(&root, "a.rhai", "let a = 1;");
        let disabled = write(&root, "_b.rhai", "let b = 1;");
        let notes = write(&root, "notes.txt", "hello");

        assert!(loader.validate(&active).expect("valid"));
        assert!(!loader.validate(&disabled).expect("disabled"));
        assert!(!loader.validate(&notes).expect("wrong extension"));
        let err = loader.validate(&root).unwrap_err();
        assert_eq!(err.kind(), ScriptErrorKind::DirectoryNotScript);
    }

    #[test]
    fn missing_roots_are_created() {
        let dir = TempDir::new().expect("temp dir");
        let (loader, facade) = loader(&dir);
        let report = loader.register();

        assert_eq!(report.loaded, 0);
        assert!(report.failures.is_empty());
        assert!(dir.path().join("scripts/library").is_dir());
        let summary = facade.messages(DiagnosticLevel::Info).pop().expect("summary line");
        assert!(summary.starts_with("Loaded 0 scripts in "), "unexpected summary: {summary}");
    }

    #[test]
    fn directories_are_reported_and_traversed() {
        let dir = TempDir::new().expect("temp dir");
        let (loader, facade) = loader(&dir);
        let main = dir.path().join("scripts/main");
        write(&main.join("nested"), "inner.rhai", "let inner = 1;");
        write(&main, "top.rhai", "let top = 1;");

        let report = loader.register();
        assert_eq!(report.applications, 2);
        assert_eq!(report.failures_of(ScriptErrorKind::DirectoryNotScript).len(), 1);
        assert_eq!(facade.messages(DiagnosticLevel::Error).len(), 1);
    }

    #[test]
    fn seeded_bindings_are_visible_to_scripts() {
        let dir = TempDir::new().expect("temp dir");
        let (loader, facade) = loader(&dir);
        write(
            &dir.path().join("scripts/library"),
            "setup.rhai",
            r#"
                let ext = config.extension;
                let cycle = registration.cycle();
                addon.info("library for " + registration.addon());
            "#,
        );

        let report = loader.register();
        assert_eq!(report.libraries, 1, "failures: {:?}", report.failures);
        let ext = loader.shared().get("ext").expect("ext merged");
        assert_eq!(ext.as_str(), Some("rhai"));
        assert_eq!(loader.shared().get("cycle").and_then(|v| v.as_int()), Some(1));
        assert!(facade.messages(DiagnosticLevel::Info).contains(&"library for scroll-rhai".to_string()));
        assert_eq!(loader.registration().loaded(), 1);
    }

    #[test]
    fn loading_the_same_path_replaces_the_unit_and_its_watcher() {
        let dir = TempDir::new().expect("temp dir");
        let (loader, _) = loader(&dir);
        let path = write(&dir.path().join("scripts/main"), "app.rhai", "let hits = 0;");

        let first = loader.load_script(&path, ScriptCategory::Application).expect("first load");
        let fired = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&fired);
        first.register_unload_hook(crate::unit::UnloadHook::native(move || {
            *counter.lock().expect("counter") += 1;
        }));
        let second = loader.load_script(&path, ScriptCategory::Application).expect("second load");

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(*fired.lock().expect("counter"), 1);
        assert_eq!(loader.registry().len(), 1);
        assert_eq!(loader.units().len(), 1);
    }

    #[test]
    fn unload_script_deregisters_its_watcher() {
        let dir = TempDir::new().expect("temp dir");
        let (loader, _) = loader(&dir);
        let path = write(&dir.path().join("scripts/main"), "app.rhai", "let a = 1;");
        loader.load_script(&path, ScriptCategory::Application).expect("load");

        let unit = loader.unload_script(&path).expect("unit was tracked");
        assert_eq!(unit.state(), crate::unit::UnitState::Unloaded);
        assert!(loader.registry().is_empty());
        assert!(loader.unit(&path).is_none());
        assert!(loader.unload_script(&path).is_none());
        assert!(unit.is_retired());
        unit.set_auto_reload(true);
        assert_eq!(unit.reload().expect("reload"), crate::unit::ReloadOutcome::Disarmed);
    }
}
