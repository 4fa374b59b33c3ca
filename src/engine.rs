use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;

use rhai::{Dynamic, Engine, FnPtr, Scope, AST};
use tracing::{debug, info};

use crate::api;
use crate::bindings::{BindingValue, ExecutionScope, SCOPE_BINDING};
use crate::config::EngineConfig;
use crate::error::ScriptError;

/// A compiled script, linked against every class script known when it was compiled.
#[derive(Clone)]
pub struct CompiledScript {
    path: PathBuf,
    ast: Arc<AST>,
    modified: Option<SystemTime>,
}

impl CompiledScript {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ast(&self) -> &AST {
        &self.ast
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }
}

/// Everything the lifecycle code needs from the scripting backend.
pub trait ScriptEngine: Send + Sync {
    /// Compiles a script, reusing the cached compilation while the file is unchanged.
    fn compile(&self, path: &Path) -> Result<CompiledScript, ScriptError>;
    /// Compiles a class script and makes its functions available to every later compilation.
    fn compile_class(&self, path: &Path) -> Result<CompiledScript, ScriptError>;
    /// Drops any cached compilation for `path` and compiles it again.
    fn recompile(&self, path: &Path) -> Result<CompiledScript, ScriptError>;
    /// Runs the script against `scope`; top-level declarations land in the scope's overlay.
    fn execute(&self, script: &CompiledScript, scope: &mut ExecutionScope) -> Result<(), ScriptError>;
    fn call_hook(&self, script: &CompiledScript, hook: &FnPtr) -> Result<(), ScriptError>;
}

pub struct RhaiScriptEngine {
    engine: Engine,
    classes: RwLock<BTreeMap<PathBuf, AST>>,
    cache: Mutex<HashMap<PathBuf, CompiledScript>>,
}

impl RhaiScriptEngine {
    pub fn new(config: &EngineConfig) -> Self {
        let mut engine = Engine::new();
        engine.set_fast_operators(true);
        if config.max_operations > 0 {
            engine.set_max_operations(config.max_operations);
        }
        engine.set_max_call_levels(config.max_call_depth);
        if config.max_string_size > 0 {
            engine.set_max_string_size(config.max_string_size);
        }
        engine.on_print(|text| info!(target: "script", "{text}"));
        engine.on_debug(|text, source, pos| {
            debug!(target: "script", source = source.unwrap_or("<unknown>"), "{text} @ {pos}")
        });
        engine.on_var(|name, _, context| {
            if name == SCOPE_BINDING && context.call_level() == 0 {
                api::refresh_scope_handle(context.scope());
            }
            Ok(None)
        });
        api::register_api(&mut engine);
        Self { engine, classes: RwLock::new(BTreeMap::new()), cache: Mutex::new(HashMap::new()) }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn class_count(&self) -> usize {
        self.classes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn parse(&self, path: &Path) -> Result<(AST, Option<SystemTime>), ScriptError> {
        let source = fs::read_to_string(path)
            .map_err(|source| ScriptError::FileAccess { path: path.to_path_buf(), source })?;
        let modified = modified_time(path);
        let ast = self
            .engine
            .compile(source)
            .map_err(|err| ScriptError::Compile { path: path.to_path_buf(), message: err.to_string() })?;
        Ok((ast, modified))
    }

    fn link(&self, path: &Path, ast: AST) -> AST {
        let classes = self.classes.read().unwrap_or_else(PoisonError::into_inner);
        let mut linked = AST::empty();
        for class in classes.values() {
            linked.combine(class.clone());
        }
        linked.combine(ast);
        linked.set_source(path.to_string_lossy().as_ref());
        linked
    }

    fn compile_fresh(&self, path: &Path) -> Result<CompiledScript, ScriptError> {
        let (ast, modified) = self.parse(path)?;
        let ast = Arc::new(self.link(path, ast));
        let compiled = CompiledScript { path: path.to_path_buf(), ast, modified };
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), compiled.clone());
        Ok(compiled)
    }
}

impl ScriptEngine for RhaiScriptEngine {
    fn compile(&self, path: &Path) -> Result<CompiledScript, ScriptError> {
        let cached = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(path).cloned();
        if let Some(cached) = cached {
            let current = modified_time(path);
            if cached.modified.is_some() && cached.modified == current {
                return Ok(cached);
            }
        }
        self.compile_fresh(path)
    }

    fn compile_class(&self, path: &Path) -> Result<CompiledScript, ScriptError> {
        let (ast, modified) = self.parse(path)?;
        self.classes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), ast.clone_functions_only());
        // Cached scripts were linked against the previous class set.
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
        debug!(target: "scripts", path = %path.display(), "registered class script");
        Ok(CompiledScript { path: path.to_path_buf(), ast: Arc::new(ast), modified })
    }

    fn recompile(&self, path: &Path) -> Result<CompiledScript, ScriptError> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).remove(path);
        self.compile_fresh(path)
    }

    fn execute(&self, script: &CompiledScript, scope: &mut ExecutionScope) -> Result<(), ScriptError> {
        let mut rhai_scope = Scope::new();
        // Shared entries are constants so a script can shadow them with `let` but never write through.
        for (name, value) in scope.shared().snapshot() {
            rhai_scope.push_constant_dynamic(name, value.into_dynamic());
        }
        for (name, value) in scope.locals() {
            rhai_scope.push_dynamic(name.clone(), value.clone().into_dynamic());
        }
        let base = rhai_scope.len();

        self.engine
            .run_ast_with_scope(&mut rhai_scope, script.ast())
            .map_err(|err| ScriptError::from_eval(script.path(), err))?;

        // `iter` walks entries in push order; `iter_raw` walks them newest first.
        let declared: Vec<(String, Dynamic)> =
            rhai_scope.iter().skip(base).map(|(name, _, value)| (name.to_string(), value)).collect();
        for (name, value) in declared {
            scope.set(name, BindingValue::from_dynamic(value));
        }
        Ok(())
    }

    fn call_hook(&self, script: &CompiledScript, hook: &FnPtr) -> Result<(), ScriptError> {
        hook.call::<Dynamic>(&self.engine, script.ast(), ())
            .map(|_| ())
            .map_err(|err| ScriptError::from_eval(script.path(), err))
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).ok().and_then(|meta| meta.modified().ok())
}
