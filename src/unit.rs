use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use rhai::FnPtr;
use tracing::debug;

use crate::api::{ScopeHandle, UnitHandle};
use crate::bindings::{BindingValue, ExecutionScope, SharedBindings, SCOPE_BINDING, SCRIPT_BINDING};
use crate::engine::{CompiledScript, ScriptEngine};
use crate::error::ScriptError;
use crate::facade::HostFacade;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScriptCategory {
    Class,
    Library,
    Application,
}

impl ScriptCategory {
    /// Fixed batch order.
    pub const ORDER: [ScriptCategory; 3] =
        [ScriptCategory::Class, ScriptCategory::Library, ScriptCategory::Application];

    pub fn label(self) -> &'static str {
        match self {
            ScriptCategory::Class => "class",
            ScriptCategory::Library => "library",
            ScriptCategory::Application => "application",
        }
    }

    /// Whether successful runs publish their declarations into the shared tier.
    pub fn contributes(self) -> bool {
        matches!(self, ScriptCategory::Library)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Unloaded,
    Loaded,
    Reloading,
}

impl UnitState {
    pub fn label(self) -> &'static str {
        match self {
            UnitState::Unloaded => "unloaded",
            UnitState::Loaded => "loaded",
            UnitState::Reloading => "reloading",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Reloaded,
    /// Auto-reload is not armed for the unit.
    Disarmed,
    /// Another reload of the same unit was in flight; it will run once more when it finishes.
    Queued,
}

pub enum UnloadHook {
    Native(Box<dyn FnMut() + Send>),
    Script(FnPtr),
}

impl UnloadHook {
    pub fn native(callback: impl FnMut() + Send + 'static) -> Self {
        UnloadHook::Native(Box::new(callback))
    }
}

/// Collaborators every unit runs against.
#[derive(Clone)]
pub struct HostContext {
    pub engine: Arc<dyn ScriptEngine>,
    pub shared: SharedBindings,
    pub facade: Arc<dyn HostFacade>,
}

struct UnitInner {
    compiled: Option<CompiledScript>,
    hooks: Vec<UnloadHook>,
    state: UnitState,
}

/// Lifecycle wrapper around one script file.
pub struct ScriptUnit {
    path: PathBuf,
    category: ScriptCategory,
    context: HostContext,
    auto_reload: AtomicBool,
    inner: Mutex<UnitInner>,
    reload_gate: Mutex<()>,
    reload_pending: AtomicBool,
    retired: AtomicBool,
}

impl ScriptUnit {
    pub fn new(path: impl Into<PathBuf>, category: ScriptCategory, context: HostContext) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            category,
            context,
            auto_reload: AtomicBool::new(false),
            inner: Mutex::new(UnitInner { compiled: None, hooks: Vec::new(), state: UnitState::Unloaded }),
            reload_gate: Mutex::new(()),
            reload_pending: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default()
    }

    pub fn category(&self) -> ScriptCategory {
        self.category
    }

    pub fn context(&self) -> &HostContext {
        &self.context
    }

    pub fn state(&self) -> UnitState {
        self.lock().state
    }

    pub fn is_auto_reload(&self) -> bool {
        self.auto_reload.load(Ordering::SeqCst)
    }

    pub fn set_auto_reload(&self, enabled: bool) {
        self.auto_reload.store(enabled, Ordering::SeqCst);
    }

    pub fn hook_count(&self) -> usize {
        self.lock().hooks.len()
    }

    pub fn compiled(&self) -> Option<CompiledScript> {
        self.lock().compiled.clone()
    }

    pub fn register_unload_hook(&self, hook: UnloadHook) {
        self.lock().hooks.push(hook);
    }

    /// Compiles and runs the script. On failure the unit stays unloaded and any hook the failed
    /// run registered is run and dropped.
    pub fn load(self: &Arc<Self>) -> Result<(), ScriptError> {
        let compiled = match self.category {
            ScriptCategory::Class => self.context.engine.compile_class(&self.path),
            _ => self.context.engine.compile(&self.path),
        };
        match compiled {
            Ok(compiled) => self.run(compiled),
            Err(err) => {
                self.set_state(UnitState::Unloaded);
                Err(err)
            }
        }
    }

    /// Runs every unload hook in registration order and clears the list. Returns the number run.
    ///
    /// Waits for an in-flight reload to finish first. Must not be called from one of the unit's
    /// own hooks.
    pub fn unload(&self) -> usize {
        let _gate = self.reload_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let (hooks, compiled) = self.take_hooks();
        let count = self.run_hooks(compiled.as_ref(), hooks);
        self.set_state(UnitState::Unloaded);
        count
    }

    /// Unloads the unit for good: later reload requests are ignored.
    pub fn retire(&self) -> usize {
        self.retired.store(true, Ordering::SeqCst);
        self.unload()
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub fn reload(self: &Arc<Self>) -> Result<ReloadOutcome, ScriptError> {
        if !self.is_auto_reload() || self.is_retired() {
            return Ok(ReloadOutcome::Disarmed);
        }
        loop {
            let Some(gate) = self.acquire_reload_gate() else {
                return Ok(ReloadOutcome::Queued);
            };
            // Retirement may have landed while this request waited.
            if self.is_retired() {
                return Ok(ReloadOutcome::Disarmed);
            }
            self.reload_pending.store(false, Ordering::SeqCst);
            let result = self.reload_once();
            drop(gate);
            if !self.reload_pending.load(Ordering::SeqCst) {
                return result.map(|()| ReloadOutcome::Reloaded);
            }
            if let Err(err) = result {
                self.context.facade.report(&err);
            }
        }
    }

    fn reload_once(self: &Arc<Self>) -> Result<(), ScriptError> {
        self.set_state(UnitState::Reloading);
        let (hooks, stale) = self.take_hooks();
        self.run_hooks(stale.as_ref(), hooks);
        let recompiled = match self.category {
            ScriptCategory::Class => self.context.engine.compile_class(&self.path),
            _ => self.context.engine.recompile(&self.path),
        };
        match recompiled {
            Ok(compiled) => self.run(compiled),
            Err(err) => {
                self.set_state(UnitState::Unloaded);
                Err(err)
            }
        }
    }

    fn run(self: &Arc<Self>, compiled: CompiledScript) -> Result<(), ScriptError> {
        if self.category == ScriptCategory::Class {
            let mut inner = self.lock();
            inner.compiled = Some(compiled);
            inner.state = UnitState::Loaded;
            return Ok(());
        }

        let mut scope = ExecutionScope::new(&self.path, self.context.shared.clone());
        scope.set(SCRIPT_BINDING, BindingValue::from_handle(UnitHandle::new(self)));
        let view = ScopeHandle::new(&scope);
        scope.set(SCOPE_BINDING, BindingValue::from_handle(view));

        match self.context.engine.execute(&compiled, &mut scope) {
            Ok(()) => {
                if self.category.contributes() {
                    let merged = scope.merge_back();
                    debug!(target: "scripts", path = %self.path.display(), merged, "merged library bindings");
                }
                let mut inner = self.lock();
                inner.compiled = Some(compiled);
                inner.state = UnitState::Loaded;
                Ok(())
            }
            Err(err) => {
                let partial = mem::take(&mut self.lock().hooks);
                self.run_hooks(Some(&compiled), partial);
                self.set_state(UnitState::Unloaded);
                Err(err)
            }
        }
    }

    fn take_hooks(&self) -> (Vec<UnloadHook>, Option<CompiledScript>) {
        let mut inner = self.lock();
        (mem::take(&mut inner.hooks), inner.compiled.clone())
    }

    // Hooks run outside the unit lock so they may call back into the unit.
    fn run_hooks(&self, compiled: Option<&CompiledScript>, hooks: Vec<UnloadHook>) -> usize {
        let count = hooks.len();
        for hook in hooks {
            match hook {
                UnloadHook::Native(mut callback) => callback(),
                UnloadHook::Script(pointer) => {
                    let Some(compiled) = compiled else {
                        self.context.facade.warn(&format!(
                            "Skipping unload hook '{}' of script '{}': no compiled script",
                            pointer.fn_name(),
                            self.name()
                        ));
                        continue;
                    };
                    if let Err(err) = self.context.engine.call_hook(compiled, &pointer) {
                        let context = format!("Unload hook failed in script '{}'", self.name());
                        self.context.facade.print_exception(&err, &context);
                    }
                }
            }
        }
        count
    }

    fn acquire_reload_gate(&self) -> Option<MutexGuard<'_, ()>> {
        match self.reload_gate.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                // Flag first, then retry: the holder checks the flag after releasing the gate.
                self.reload_pending.store(true, Ordering::SeqCst);
                match self.reload_gate.try_lock() {
                    Ok(guard) => Some(guard),
                    Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
                    Err(TryLockError::WouldBlock) => None,
                }
            }
        }
    }

    fn set_state(&self, state: UnitState) {
        self.lock().state = state;
    }

    fn lock(&self) -> MutexGuard<'_, UnitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
