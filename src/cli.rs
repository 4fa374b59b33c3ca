use crate::config::HostConfigOverrides;
use anyhow::{anyhow, bail, Result};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    config: Option<PathBuf>,
    scripts: Option<PathBuf>,
    library: Option<PathBuf>,
    classes: Option<PathBuf>,
    watch: Option<bool>,
    auto_reload: Option<bool>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            let Some(key) = flag.strip_prefix("--") else {
                bail!("Unexpected argument '{flag}'. Flags take the form --name <value>.");
            };
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "config" => overrides.config = Some(PathBuf::from(value)),
                "scripts" => overrides.scripts = Some(PathBuf::from(value)),
                "library" => overrides.library = Some(PathBuf::from(value)),
                "classes" => overrides.classes = Some(PathBuf::from(value)),
                "watch" => overrides.watch = Some(parse_bool_flag("watch", &value)?),
                "auto-reload" => overrides.auto_reload = Some(parse_bool_flag("auto-reload", &value)?),
                _ => bail!(
                    "Unknown flag '{flag}'. Supported flags: --config, --scripts, --library, --classes, \
                     --watch, --auto-reload."
                ),
            }
        }
        Ok(overrides)
    }

    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config.as_ref()
    }

    pub fn into_config_overrides(self) -> HostConfigOverrides {
        HostConfigOverrides {
            scripts_dir: self.scripts,
            library_dir: self.library,
            class_dir: self.classes,
            watch: self.watch,
            auto_reload: self.auto_reload,
        }
    }
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid {flag} value '{other}'. Use on/off or true/false."),
    }
}
