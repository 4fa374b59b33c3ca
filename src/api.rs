use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, Weak};

use rhai::{Array, Dynamic, Engine, EvalAltResult, FnPtr, NativeCallContext, Position, Scope, INT};

use crate::bindings::{BindingValue, ExecutionScope, SharedBindings, SCOPE_BINDING};
use crate::error::ScriptError;
use crate::facade::HostFacade;
use crate::unit::{ScriptUnit, UnloadHook};

/// State of the current registration cycle, readable from scripts as `registration`.
#[derive(Clone)]
pub struct RegistrationHandle {
    addon: Arc<str>,
    cycle: Arc<AtomicU64>,
    loaded: Arc<AtomicUsize>,
}

impl RegistrationHandle {
    pub fn new(addon: &str) -> Self {
        Self {
            addon: Arc::from(addon),
            cycle: Arc::new(AtomicU64::new(0)),
            loaded: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn addon(&self) -> &str {
        &self.addon
    }

    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::SeqCst)
    }

    pub fn loaded(&self) -> usize {
        self.loaded.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_cycle(&self) -> u64 {
        self.loaded.store(0, Ordering::SeqCst);
        self.cycle.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn record_loaded(&self) {
        self.loaded.fetch_add(1, Ordering::SeqCst);
    }
}

/// Logging pass-through exposed to scripts as `addon`.
#[derive(Clone)]
pub struct AddonHandle {
    facade: Arc<dyn HostFacade>,
    registration: RegistrationHandle,
}

impl AddonHandle {
    pub fn new(facade: Arc<dyn HostFacade>, registration: RegistrationHandle) -> Self {
        Self { facade, registration }
    }

    /// Reports an error a script caught itself, attributed to the calling script.
    fn print_exception(&self, source: Option<&str>, error: &Dynamic, context: &str) {
        let error = ScriptError::Execution {
            path: PathBuf::from(source.unwrap_or("<unknown>")),
            message: error.to_string(),
        };
        self.facade.print_exception(&error, context);
    }
}

/// The running unit, exposed to scripts as `script`. Holds a weak reference so closures that
/// capture it do not keep the unit alive through its own hook list.
#[derive(Clone)]
pub struct UnitHandle {
    unit: Weak<ScriptUnit>,
    path: PathBuf,
}

impl UnitHandle {
    pub fn new(unit: &Arc<ScriptUnit>) -> Self {
        Self { unit: Arc::downgrade(unit), path: unit.path().to_path_buf() }
    }

    pub fn unit(&self) -> Option<Arc<ScriptUnit>> {
        self.unit.upgrade()
    }

    fn path_string(&self) -> String {
        self.path.display().to_string()
    }

    fn name(&self) -> String {
        self.path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default()
    }

    fn is_auto_reload(&self) -> bool {
        self.unit().map(|unit| unit.is_auto_reload()).unwrap_or(false)
    }

    fn set_auto_reload(&self, enabled: bool) {
        if let Some(unit) = self.unit() {
            unit.set_auto_reload(enabled);
        }
    }

    fn state_label(&self) -> String {
        self.unit().map(|unit| unit.state().label()).unwrap_or("dropped").to_string()
    }

    fn on_unload(&self, hook: FnPtr) {
        if let Some(unit) = self.unit() {
            unit.register_unload_hook(UnloadHook::Script(hook));
        }
    }
}

/// Read-only view of an execution scope, exposed to scripts as `bindings`. The overlay half is
/// live: it is refreshed from the running scope each time the script names `bindings`.
#[derive(Clone)]
pub struct ScopeHandle {
    shared: SharedBindings,
    locals: Arc<RwLock<BTreeMap<String, BindingValue>>>,
}

impl ScopeHandle {
    pub fn new(scope: &ExecutionScope) -> Self {
        Self { shared: scope.shared().clone(), locals: Arc::new(RwLock::new(scope.locals().clone())) }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.shared.names().into_iter().collect();
        names.extend(self.read_locals().keys().cloned());
        names.insert(SCOPE_BINDING.to_string());
        names.into_iter().collect()
    }

    pub fn has(&self, name: &str) -> bool {
        name == SCOPE_BINDING || self.read_locals().contains_key(name) || self.shared.contains(name)
    }

    pub fn get(&self, name: &str) -> Option<BindingValue> {
        if name == SCOPE_BINDING {
            return Some(BindingValue::from_handle(self.clone()));
        }
        self.read_locals().get(name).cloned().or_else(|| self.shared.get(name))
    }

    /// Replaces the overlay view with the visible entries of `scope`, newest shadow winning.
    /// Handles of this type are left out so the view never owns itself.
    pub(crate) fn refresh(&self, scope: &Scope) {
        let mut locals = BTreeMap::new();
        for (name, _, value) in scope.iter() {
            if value.is::<ScopeHandle>() {
                continue;
            }
            locals.insert(name.to_string(), BindingValue::from_dynamic(value));
        }
        *self.locals.write().unwrap_or_else(PoisonError::into_inner) = locals;
    }

    fn read_locals(&self) -> RwLockReadGuard<'_, BTreeMap<String, BindingValue>> {
        self.locals.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Brings the `bindings` handle visible in `scope`, if any, up to date with it.
pub(crate) fn refresh_scope_handle(scope: &Scope) {
    if let Some(handle) = scope.get_value::<ScopeHandle>(SCOPE_BINDING) {
        handle.refresh(scope);
    }
}

pub(crate) fn register_api(engine: &mut Engine) {
    engine.register_type_with_name::<AddonHandle>("Addon");
    engine.register_fn("info", |addon: AddonHandle, message: &str| addon.facade.info(message));
    engine.register_fn("warn", |addon: AddonHandle, message: &str| addon.facade.warn(message));
    engine.register_fn("error", |addon: AddonHandle, message: &str| addon.facade.error(message));
    engine.register_fn("registration", |addon: AddonHandle| addon.registration.clone());
    engine.register_fn(
        "print_exception",
        |ctx: NativeCallContext, addon: AddonHandle, error: Dynamic, context: &str| {
            addon.print_exception(ctx.call_source(), &error, context)
        },
    );

    engine.register_type_with_name::<RegistrationHandle>("Registration");
    engine.register_fn("addon", |registration: RegistrationHandle| registration.addon().to_string());
    engine.register_fn("cycle", |registration: RegistrationHandle| registration.cycle() as INT);
    engine.register_fn("loaded", |registration: RegistrationHandle| registration.loaded() as INT);

    engine.register_type_with_name::<UnitHandle>("Script");
    engine.register_get("path", |handle: &mut UnitHandle| handle.path_string());
    engine.register_get("name", |handle: &mut UnitHandle| handle.name());
    engine.register_get("state", |handle: &mut UnitHandle| handle.state_label());
    engine.register_get_set(
        "auto_reload",
        |handle: &mut UnitHandle| handle.is_auto_reload(),
        |handle: &mut UnitHandle, enabled: bool| handle.set_auto_reload(enabled),
    );
    engine.register_fn("set_auto_reload", |handle: UnitHandle, enabled: bool| handle.set_auto_reload(enabled));
    engine.register_fn("on_unload", |handle: UnitHandle, hook: FnPtr| handle.on_unload(hook));

    engine.register_type_with_name::<ScopeHandle>("Bindings");
    engine.register_fn("names", |scope: ScopeHandle| -> Array {
        scope.names().into_iter().map(Dynamic::from).collect()
    });
    engine.register_fn("has", |scope: ScopeHandle, name: &str| scope.has(name));
    engine.register_fn("get", |scope: ScopeHandle, name: &str| -> Result<Dynamic, Box<EvalAltResult>> {
        scope
            .get(name)
            .map(BindingValue::into_dynamic)
            .ok_or_else(|| EvalAltResult::ErrorVariableNotFound(name.to_string(), Position::NONE).into())
    });
}
