use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use rhai::{Array, Dynamic, ImmutableString, Map, FLOAT, INT};

use crate::error::ScriptError;

/// Per-execution handle to the running unit.
pub const SCRIPT_BINDING: &str = "script";
/// Per-execution handle over the scope itself.
pub const SCOPE_BINDING: &str = "bindings";

/// Tagged value stored under a binding name.
#[derive(Debug, Clone)]
pub enum BindingValue {
    Unit,
    Bool(bool),
    Int(INT),
    Float(FLOAT),
    Text(String),
    Array(Vec<BindingValue>),
    Map(BTreeMap<String, BindingValue>),
    /// Host object or closure registered with the engine.
    Handle(Dynamic),
}

impl BindingValue {
    pub fn from_handle<T: Clone + Send + Sync + 'static>(handle: T) -> Self {
        BindingValue::Handle(Dynamic::from(handle))
    }

    pub fn from_dynamic(value: Dynamic) -> Self {
        let value = value.flatten();
        if value.is_unit() {
            BindingValue::Unit
        } else if value.is::<bool>() {
            BindingValue::Bool(value.cast::<bool>())
        } else if value.is::<INT>() {
            BindingValue::Int(value.cast::<INT>())
        } else if value.is::<FLOAT>() {
            BindingValue::Float(value.cast::<FLOAT>())
        } else if value.is::<ImmutableString>() {
            BindingValue::Text(value.cast::<ImmutableString>().to_string())
        } else if value.is::<Array>() {
            BindingValue::Array(value.cast::<Array>().into_iter().map(BindingValue::from_dynamic).collect())
        } else if value.is::<Map>() {
            BindingValue::Map(
                value
                    .cast::<Map>()
                    .into_iter()
                    .map(|(key, item)| (key.to_string(), BindingValue::from_dynamic(item)))
                    .collect(),
            )
        } else {
            BindingValue::Handle(value)
        }
    }

    pub fn into_dynamic(self) -> Dynamic {
        match self {
            BindingValue::Unit => Dynamic::UNIT,
            BindingValue::Bool(value) => Dynamic::from(value),
            BindingValue::Int(value) => Dynamic::from(value),
            BindingValue::Float(value) => Dynamic::from(value),
            BindingValue::Text(value) => Dynamic::from(value),
            BindingValue::Array(items) => {
                Dynamic::from_array(items.into_iter().map(BindingValue::into_dynamic).collect())
            }
            BindingValue::Map(entries) => Dynamic::from_map(
                entries.into_iter().map(|(key, value)| (key.into(), value.into_dynamic())).collect(),
            ),
            BindingValue::Handle(value) => value,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            BindingValue::Unit => "unit",
            BindingValue::Bool(_) => "bool",
            BindingValue::Int(_) => "int",
            BindingValue::Float(_) => "float",
            BindingValue::Text(_) => "text",
            BindingValue::Array(_) => "array",
            BindingValue::Map(_) => "map",
            BindingValue::Handle(_) => "handle",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            BindingValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<INT> {
        match self {
            BindingValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<FLOAT> {
        match self {
            BindingValue::Float(value) => Some(*value),
            BindingValue::Int(value) => Some(*value as FLOAT),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            BindingValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[BindingValue]> {
        match self {
            BindingValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, BindingValue>> {
        match self {
            BindingValue::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_handle<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        match self {
            BindingValue::Handle(value) => value.clone().try_cast::<T>(),
            _ => None,
        }
    }
}

impl From<bool> for BindingValue {
    fn from(value: bool) -> Self {
        BindingValue::Bool(value)
    }
}

impl From<INT> for BindingValue {
    fn from(value: INT) -> Self {
        BindingValue::Int(value)
    }
}

impl From<FLOAT> for BindingValue {
    fn from(value: FLOAT) -> Self {
        BindingValue::Float(value)
    }
}

impl From<&str> for BindingValue {
    fn from(value: &str) -> Self {
        BindingValue::Text(value.to_string())
    }
}

impl From<String> for BindingValue {
    fn from(value: String) -> Self {
        BindingValue::Text(value)
    }
}

/// Names that may flow from an execution overlay into the shared tier.
pub fn is_mergeable_name(name: &str) -> bool {
    if name == SCRIPT_BINDING || name == SCOPE_BINDING {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' => {
            chars.all(|c| c.is_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Process-wide binding tier. Cloning shares the same store.
///
/// Writers are serialized by the lock; a merge-back is applied under a single write guard so
/// concurrent reloads never interleave their entries.
#[derive(Clone, Default)]
pub struct SharedBindings {
    inner: Arc<RwLock<BTreeMap<String, BindingValue>>>,
}

impl SharedBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, value: impl Into<BindingValue>) {
        let mut entries = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<BindingValue> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<(String, BindingValue)> {
        let entries = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        entries.iter().map(|(name, value)| (name.clone(), value.clone())).collect()
    }

    /// Copies every mergeable entry into the store, overwriting existing names. Returns the count copied.
    pub fn merge<'a>(&self, entries: impl IntoIterator<Item = (&'a String, &'a BindingValue)>) -> usize {
        let mut store = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut merged = 0;
        for (name, value) in entries {
            if is_mergeable_name(name) {
                store.insert(name.clone(), value.clone());
                merged += 1;
            }
        }
        merged
    }
}

/// Private overlay for one script execution. Reads fall back to the shared tier, writes stay local.
pub struct ExecutionScope {
    path: PathBuf,
    shared: SharedBindings,
    locals: BTreeMap<String, BindingValue>,
}

impl ExecutionScope {
    pub fn new(path: impl Into<PathBuf>, shared: SharedBindings) -> Self {
        Self { path: path.into(), shared, locals: BTreeMap::new() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shared(&self) -> &SharedBindings {
        &self.shared
    }

    pub fn get(&self, name: &str) -> Option<BindingValue> {
        match self.locals.get(name) {
            Some(value) => Some(value.clone()),
            None => self.shared.get(name),
        }
    }

    pub fn resolve(&self, name: &str) -> Result<BindingValue, ScriptError> {
        self.get(name).ok_or_else(|| ScriptError::BindingResolution {
            path: self.path.clone(),
            name: name.to_string(),
        })
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<BindingValue>) {
        self.locals.insert(name.into(), value.into());
    }

    pub fn is_local(&self, name: &str) -> bool {
        self.locals.contains_key(name)
    }

    pub fn locals(&self) -> &BTreeMap<String, BindingValue> {
        &self.locals
    }

    /// Publishes the overlay into the shared tier; reserved per-execution names are never copied.
    pub fn merge_back(&self) -> usize {
        self.shared.merge(self.locals.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_reads_fall_back_to_shared_tier() {
        let shared = SharedBindings::new();
        shared.insert("svc", "shared");
        shared.insert("depth", 3 as INT);
        let mut scope = ExecutionScope::new("/scripts/a.rhai", shared.clone());
        scope.set("svc", "local");

        assert_eq!(scope.get("svc").and_then(|v| v.as_str().map(str::to_string)), Some("local".into()));
        assert_eq!(scope.get("depth").and_then(|v| v.as_int()), Some(3));
        assert_eq!(shared.get("svc").and_then(|v| v.as_str().map(str::to_string)), Some("shared".into()));
    }

    #[test]
    fn unresolved_names_report_the_script() {
        let scope = ExecutionScope::new("/scripts/a.rhai", SharedBindings::new());
        let err = scope.resolve("missing").unwrap_err();
        assert!(matches!(err, ScriptError::BindingResolution { ref name, .. } if name == "missing"));
        assert_eq!(err.file_name(), "a.rhai");
    }

    #[test]
    fn merge_back_skips_reserved_names() {
        let shared = SharedBindings::new();
        let mut scope = ExecutionScope::new("lib.rhai", shared.clone());
        scope.set(SCRIPT_BINDING, "unit");
        scope.set(SCOPE_BINDING, "scope");
        scope.set("x", 1 as INT);

        assert_eq!(scope.merge_back(), 1);
        assert_eq!(shared.names(), vec!["x".to_string()]);
    }

    #[test]
    fn later_merges_overwrite_earlier_ones() {
        let shared = SharedBindings::new();
        let mut first = ExecutionScope::new("l1.rhai", shared.clone());
        first.set("x", 1 as INT);
        first.merge_back();
        let mut second = ExecutionScope::new("l2.rhai", shared.clone());
        second.set("x", 2 as INT);
        second.merge_back();

        assert_eq!(shared.get("x").and_then(|v| v.as_int()), Some(2));
    }

    #[test]
    fn mergeable_names_must_be_identifiers() {
        assert!(is_mergeable_name("svc_2"));
        assert!(is_mergeable_name("_hidden"));
        assert!(!is_mergeable_name("2fast"));
        assert!(!is_mergeable_name(""));
        assert!(!is_mergeable_name(SCRIPT_BINDING));
    }

    #[test]
    fn dynamic_conversion_keeps_tags() {
        let mut map = Map::new();
        map.insert("n".into(), Dynamic::from(7 as INT));
        let value = BindingValue::from_dynamic(Dynamic::from_map(map));
        let entries = value.as_map().expect("map tag");
        assert_eq!(entries.get("n").and_then(|v| v.as_int()), Some(7));

        let text = BindingValue::from("hello").into_dynamic();
        assert_eq!(text.into_string().expect("string"), "hello");
        assert!(matches!(BindingValue::from_dynamic(Dynamic::UNIT), BindingValue::Unit));
    }

    #[test]
    fn handles_round_trip_through_typed_accessor() {
        #[derive(Clone)]
        struct Marker(u32);
        let value = BindingValue::from_handle(Marker(9));
        assert_eq!(value.type_name(), "handle");
        assert_eq!(value.as_handle::<Marker>().map(|m| m.0), Some(9));
        assert!(value.as_handle::<String>().is_none());
    }
}
