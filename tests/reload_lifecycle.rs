use rhai::FnPtr;
use scroll_rhai::config::EngineConfig;
use scroll_rhai::engine::{CompiledScript, RhaiScriptEngine, ScriptEngine};
use scroll_rhai::facade::DiagnosticLevel;
use scroll_rhai::{
    ExecutionScope, HostConfig, RecordingFacade, ReloadOutcome, ScriptCategory, ScriptError, ScriptErrorKind,
    ScriptLoader, UnitState, UnloadHook,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

type Journal = Arc<Mutex<Vec<String>>>;

/// Delegates to the Rhai engine and journals every recompilation.
struct JournalingEngine {
    inner: RhaiScriptEngine,
    journal: Journal,
}

impl ScriptEngine for JournalingEngine {
    fn compile(&self, path: &Path) -> Result<CompiledScript, ScriptError> {
        self.inner.compile(path)
    }

    fn compile_class(&self, path: &Path) -> Result<CompiledScript, ScriptError> {
        self.inner.compile_class(path)
    }

    fn recompile(&self, path: &Path) -> Result<CompiledScript, ScriptError> {
        self.journal.lock().expect("journal").push("recompile".to_string());
        self.inner.recompile(path)
    }

    fn execute(&self, script: &CompiledScript, scope: &mut ExecutionScope) -> Result<(), ScriptError> {
        self.inner.execute(script, scope)
    }

    fn call_hook(&self, script: &CompiledScript, hook: &FnPtr) -> Result<(), ScriptError> {
        self.inner.call_hook(script, hook)
    }
}

struct Fixture {
    dir: TempDir,
    loader: ScriptLoader,
    facade: Arc<RecordingFacade>,
    journal: Journal,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let mut config = HostConfig::rooted(dir.path());
        config.watch.enabled = false;
        config.auto_reload = true;
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let engine = Arc::new(JournalingEngine {
            inner: RhaiScriptEngine::new(&EngineConfig::default()),
            journal: Arc::clone(&journal),
        });
        let facade = Arc::new(RecordingFacade::new());
        let loader = ScriptLoader::with_engine(config, engine, facade.clone());
        Self { dir, loader, facade, journal }
    }

    fn script(&self, category_dir: &str, name: &str, contents: &str) -> PathBuf {
        let dir = self.dir.path().join(category_dir);
        fs::create_dir_all(&dir).expect("create dir");
        let path = dir.join(name);
        fs::write(&path, contents).expect("write script");
        path
    }

    fn journal(&self) -> Vec<String> {
        self.journal.lock().expect("journal").clone()
    }
}

#[test]
fn hooks_run_in_order_exactly_once_before_recompilation() {
    let fx = Fixture::new();
    let path = fx.script("scripts/main", "app.rhai", "let ready = true;");
    let unit = fx.loader.load_script(&path, ScriptCategory::Application).expect("load");

    for n in 1..=3 {
        let journal = Arc::clone(&fx.journal);
        let observed = Arc::clone(&unit);
        unit.register_unload_hook(UnloadHook::native(move || {
            let remaining = observed.hook_count();
            journal.lock().expect("journal").push(format!("hook{n} remaining={remaining}"));
        }));
    }
    assert_eq!(unit.hook_count(), 3);

    assert_eq!(unit.reload().expect("reload"), ReloadOutcome::Reloaded);

    assert_eq!(fx.journal(), vec!["hook1 remaining=0", "hook2 remaining=0", "hook3 remaining=0", "recompile"]);
    assert_eq!(unit.hook_count(), 0);
    assert_eq!(unit.state(), UnitState::Loaded);
}

#[test]
fn script_registered_hooks_run_on_reload() {
    let fx = Fixture::new();
    let path = fx.script(
        "scripts/main",
        "hooks.rhai",
        r#"
            script.on_unload(|| addon.info("first"));
            script.on_unload(|| addon.info("second"));
        "#,
    );
    let unit = fx.loader.load_script(&path, ScriptCategory::Application).expect("load");
    assert_eq!(unit.hook_count(), 2);

    unit.reload().expect("reload");

    let infos = fx.facade.messages(DiagnosticLevel::Info);
    assert_eq!(infos, vec!["first".to_string(), "second".to_string()]);
    assert_eq!(unit.hook_count(), 2, "the re-run registers its hooks again");
}

#[test]
fn reloading_an_unchanged_library_is_idempotent() {
    let fx = Fixture::new();
    let path = fx.script("scripts/library", "services.rhai", "let svc = \"db\"; let ports = [80, 443];");
    fx.loader.register();
    let names_before = fx.loader.shared().names();

    let unit = fx.loader.unit(&path).expect("unit");
    unit.reload().expect("first reload");
    unit.reload().expect("second reload");

    let shared = fx.loader.shared();
    assert_eq!(shared.names(), names_before);
    assert_eq!(shared.get("svc").and_then(|v| v.as_str().map(str::to_string)), Some("db".to_string()));
    let ports: Vec<_> = shared
        .get("ports")
        .and_then(|v| v.as_array().map(|items| items.iter().filter_map(|item| item.as_int()).collect()))
        .expect("ports array");
    assert_eq!(ports, vec![80, 443]);
}

#[test]
fn edited_library_republishes_on_reload() {
    let fx = Fixture::new();
    let path = fx.script("scripts/library", "svc.rhai", "let svc = 1;");
    fx.loader.register();
    fs::write(&path, "let svc = 2;").expect("edit script");

    let summary = fx.loader.reload_all();

    assert_eq!(summary.reloaded, 1);
    assert_eq!(fx.loader.shared().get("svc").and_then(|v| v.as_int()), Some(2));
}

#[test]
fn failed_recompile_keeps_stale_script_and_registry_continues() {
    let fx = Fixture::new();
    let broken = fx.script("scripts/main", "a.rhai", "let a = 1;");
    fx.script("scripts/main", "b.rhai", "addon.info(\"b ran\");");
    fx.loader.register();
    fs::write(&broken, "let a = ;").expect("break script");
    fx.facade.clear();

    let summary = fx.loader.reload_all();

    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.reloaded, 1);
    let unit = fx.loader.unit(&broken).expect("unit");
    assert_eq!(unit.state(), UnitState::Unloaded);
    assert!(unit.compiled().is_some(), "stale compiled script is kept");
    assert_eq!(fx.facade.exceptions_of(ScriptErrorKind::Compile).len(), 1);
    assert!(fx.facade.messages(DiagnosticLevel::Info).contains(&"b ran".to_string()));
}

#[test]
fn disarmed_units_ignore_reload_requests() {
    let fx = Fixture::new();
    let path = fx.script("scripts/main", "quiet.rhai", "script.auto_reload = false;");
    let unit = fx.loader.load_script(&path, ScriptCategory::Application).expect("load");
    assert!(!unit.is_auto_reload());

    assert_eq!(unit.reload().expect("reload"), ReloadOutcome::Disarmed);
    assert!(fx.journal().is_empty(), "no recompilation for a disarmed unit");
}

#[test]
fn shutdown_runs_every_unit_hook() {
    let fx = Fixture::new();
    fx.script("scripts/main", "one.rhai", "script.on_unload(|| addon.info(\"one unloaded\"));");
    fx.script("scripts/main", "two.rhai", "script.on_unload(|| addon.info(\"two unloaded\"));");
    fx.loader.register();
    fx.facade.clear();

    fx.loader.shutdown();

    let infos = fx.facade.messages(DiagnosticLevel::Info);
    assert!(infos.contains(&"one unloaded".to_string()));
    assert!(infos.contains(&"two unloaded".to_string()));
    assert!(fx.loader.units().is_empty());
}
