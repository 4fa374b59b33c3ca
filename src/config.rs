use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::bindings::BindingValue;
use crate::unit::ScriptCategory;

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "WatchConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "WatchConfig::default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "WatchConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on operations per script run; 0 disables the limit.
    #[serde(default)]
    pub max_operations: u64,
    #[serde(default = "EngineConfig::default_max_call_depth")]
    pub max_call_depth: usize,
    #[serde(default)]
    pub max_string_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    #[serde(default = "HostConfig::default_addon_name")]
    pub addon_name: String,
    #[serde(default = "HostConfig::default_class_dir")]
    pub class_dir: PathBuf,
    #[serde(default = "HostConfig::default_library_dir")]
    pub library_dir: PathBuf,
    #[serde(default = "HostConfig::default_scripts_dir")]
    pub scripts_dir: PathBuf,
    #[serde(default = "HostConfig::default_extension")]
    pub extension: String,
    #[serde(default = "HostConfig::default_disabled_prefix")]
    pub disabled_prefix: String,
    #[serde(default)]
    pub auto_reload: bool,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Default)]
pub struct HostConfigOverrides {
    pub scripts_dir: Option<PathBuf>,
    pub library_dir: Option<PathBuf>,
    pub class_dir: Option<PathBuf>,
    pub watch: Option<bool>,
    pub auto_reload: Option<bool>,
}

impl WatchConfig {
    const fn default_enabled() -> bool {
        true
    }

    const fn default_debounce_ms() -> u64 {
        150
    }

    const fn default_poll_interval_ms() -> u64 {
        300
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            debounce_ms: Self::default_debounce_ms(),
            poll_interval_ms: Self::default_poll_interval_ms(),
        }
    }
}

impl EngineConfig {
    const fn default_max_call_depth() -> usize {
        64
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_operations: 0, max_call_depth: Self::default_max_call_depth(), max_string_size: 0 }
    }
}

impl HostConfig {
    fn default_addon_name() -> String {
        "scroll-rhai".to_string()
    }

    fn default_class_dir() -> PathBuf {
        PathBuf::from("scripts/classes")
    }

    fn default_library_dir() -> PathBuf {
        PathBuf::from("scripts/library")
    }

    fn default_scripts_dir() -> PathBuf {
        PathBuf::from("scripts/main")
    }

    fn default_extension() -> String {
        "rhai".to_string()
    }

    fn default_disabled_prefix() -> String {
        "_".to_string()
    }

    /// Defaults with the three script directories placed under `root`.
    pub fn rooted(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let mut cfg = Self::default();
        cfg.class_dir = root.join(&cfg.class_dir);
        cfg.library_dir = root.join(&cfg.library_dir);
        cfg.scripts_dir = root.join(&cfg.scripts_dir);
        cfg
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &HostConfigOverrides) {
        if let Some(dir) = &overrides.scripts_dir {
            self.scripts_dir = dir.clone();
        }
        if let Some(dir) = &overrides.library_dir {
            self.library_dir = dir.clone();
        }
        if let Some(dir) = &overrides.class_dir {
            self.class_dir = dir.clone();
        }
        if let Some(enabled) = overrides.watch {
            self.watch.enabled = enabled;
        }
        if let Some(enabled) = overrides.auto_reload {
            self.auto_reload = enabled;
        }
    }

    pub fn directory_for(&self, category: ScriptCategory) -> &Path {
        match category {
            ScriptCategory::Class => &self.class_dir,
            ScriptCategory::Library => &self.library_dir,
            ScriptCategory::Application => &self.scripts_dir,
        }
    }

    /// Settings exposed to scripts through the `config` binding.
    pub fn binding_map(&self) -> BindingValue {
        let mut map = BTreeMap::new();
        map.insert("addon_name".to_string(), BindingValue::from(self.addon_name.as_str()));
        map.insert("extension".to_string(), BindingValue::from(self.extension.as_str()));
        map.insert("auto_reload".to_string(), BindingValue::from(self.auto_reload));
        map.insert("watch".to_string(), BindingValue::from(self.watch.enabled));
        map.insert("debounce_ms".to_string(), BindingValue::Int(saturating_int(self.watch.debounce_ms)));
        map.insert("max_operations".to_string(), BindingValue::Int(saturating_int(self.engine.max_operations)));
        map.insert(
            "max_call_depth".to_string(),
            BindingValue::Int(saturating_int(self.engine.max_call_depth as u64)),
        );
        map.insert("scripts_dir".to_string(), BindingValue::Text(self.scripts_dir.display().to_string()));
        map.insert("library_dir".to_string(), BindingValue::Text(self.library_dir.display().to_string()));
        map.insert("class_dir".to_string(), BindingValue::Text(self.class_dir.display().to_string()));
        BindingValue::Map(map)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            addon_name: Self::default_addon_name(),
            class_dir: Self::default_class_dir(),
            library_dir: Self::default_library_dir(),
            scripts_dir: Self::default_scripts_dir(),
            extension: Self::default_extension(),
            disabled_prefix: Self::default_disabled_prefix(),
            auto_reload: false,
            watch: WatchConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl HostConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.scripts_dir.is_none()
            && self.library_dir.is_none()
            && self.class_dir.is_none()
            && self.watch.is_none()
            && self.auto_reload.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.scripts_dir.is_some() {
            fields.push("scripts_dir");
        }
        if self.library_dir.is_some() {
            fields.push("library_dir");
        }
        if self.class_dir.is_some() {
            fields.push("class_dir");
        }
        if self.watch.is_some() {
            fields.push("watch");
        }
        if self.auto_reload.is_some() {
            fields.push("auto_reload");
        }
        fields
    }
}

fn saturating_int(value: u64) -> rhai::INT {
    rhai::INT::try_from(value).unwrap_or(rhai::INT::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_fields_take_defaults() {
        let mut file = NamedTempFile::new().expect("temp config");
        write!(file, r#"{{ "scripts_dir": "game/scripts", "watch": {{ "debounce_ms": 40 }} }}"#)
            .expect("write");
        let cfg = HostConfig::load(file.path()).expect("load config");

        assert_eq!(cfg.scripts_dir, PathBuf::from("game/scripts"));
        assert_eq!(cfg.library_dir, PathBuf::from("scripts/library"));
        assert_eq!(cfg.watch.debounce(), Duration::from_millis(40));
        assert!(cfg.watch.enabled);
        assert_eq!(cfg.engine.max_call_depth, 64);
        assert_eq!(cfg.extension, "rhai");
        assert_eq!(cfg.disabled_prefix, "_");
    }

    #[test]
    fn unreadable_config_falls_back_to_defaults() {
        let cfg = HostConfig::load_or_default("/definitely/not/a/config.json");
        assert_eq!(cfg.addon_name, "scroll-rhai");
        assert!(!cfg.auto_reload);
    }

    #[test]
    fn overrides_replace_only_present_fields() {
        let mut cfg = HostConfig::default();
        let overrides = HostConfigOverrides {
            library_dir: Some(PathBuf::from("lib")),
            watch: Some(false),
            ..HostConfigOverrides::default()
        };
        assert!(!overrides.is_empty());
        assert_eq!(overrides.applied_fields(), vec!["library_dir", "watch"]);
        cfg.apply_overrides(&overrides);

        assert_eq!(cfg.library_dir, PathBuf::from("lib"));
        assert_eq!(cfg.scripts_dir, PathBuf::from("scripts/main"));
        assert!(!cfg.watch.enabled);
        assert!(HostConfigOverrides::default().is_empty());
    }

    #[test]
    fn directories_follow_category() {
        let cfg = HostConfig::rooted("/srv/addon");
        assert_eq!(cfg.directory_for(ScriptCategory::Class), Path::new("/srv/addon/scripts/classes"));
        assert_eq!(cfg.directory_for(ScriptCategory::Library), Path::new("/srv/addon/scripts/library"));
        assert_eq!(cfg.directory_for(ScriptCategory::Application), Path::new("/srv/addon/scripts/main"));
    }

    #[test]
    fn binding_map_exposes_engine_settings() {
        let cfg = HostConfig::default();
        let map = cfg.binding_map();
        let entries = map.as_map().expect("map binding");
        assert_eq!(entries.get("max_call_depth").and_then(BindingValue::as_int), Some(64));
        assert_eq!(entries.get("addon_name").and_then(BindingValue::as_str), Some("scroll-rhai"));
    }
}
