use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// `module:function` naming the script entry point.
pub const ENTRY_ENV: &str = "KESTREL_VM_ENTRY";
/// Script search directories, in the platform's path-list syntax.
pub const SCRIPT_PATH_ENV: &str = "KESTREL_VM_PATH";
/// Optional JSON config file.
pub const CONFIG_ENV: &str = "KESTREL_VM_CONFIG";
/// `env_logger` filter for the bridge's diagnostics.
pub const LOG_ENV: &str = "KESTREL_VM_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScriptLimits {
    /// Upper bound on operations per script call; zero means unlimited.
    #[serde(default = "ScriptLimits::default_max_operations")]
    pub max_operations: u64,
    #[serde(default = "ScriptLimits::default_max_call_levels")]
    pub max_call_levels: usize,
}

impl ScriptLimits {
    const fn default_max_operations() -> u64 {
        0
    }

    const fn default_max_call_levels() -> usize {
        64
    }
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: Self::default_max_operations(),
            max_call_levels: Self::default_max_call_levels(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BridgeConfig {
    /// Raw `module:function` spec; validated by the initialization sequencer.
    #[serde(default)]
    pub entry: Option<String>,
    #[serde(default)]
    pub script_paths: Vec<PathBuf>,
    #[serde(default)]
    pub limits: ScriptLimits,
}

/// Values taken from the process environment, applied on top of the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeConfigOverrides {
    pub entry: Option<String>,
    pub script_paths: Vec<PathBuf>,
}

impl BridgeConfig {
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
                log::error!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    /// Reads the config file named by [`CONFIG_ENV`] (if any) and applies the environment
    /// overrides.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var_os(key))
    }

    /// Same as [`BridgeConfig::from_env`] with an injectable variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let mut cfg = match lookup(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::load_or_default(PathBuf::from(path)),
            _ => Self::default(),
        };
        cfg.apply_overrides(&BridgeConfigOverrides::from_lookup(&lookup));
        cfg
    }

    pub fn apply_overrides(&mut self, overrides: &BridgeConfigOverrides) {
        if let Some(entry) = &overrides.entry {
            self.entry = Some(entry.clone());
        }
        if !overrides.script_paths.is_empty() {
            let mut paths = overrides.script_paths.clone();
            paths.append(&mut self.script_paths);
            self.script_paths = paths;
        }
    }

    /// Directories searched for script modules, in priority order.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        if self.script_paths.is_empty() {
            vec![PathBuf::from(".")]
        } else {
            self.script_paths.clone()
        }
    }
}

impl BridgeConfigOverrides {
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let entry = lookup(ENTRY_ENV).map(|value| value.to_string_lossy().into_owned());
        let script_paths = lookup(SCRIPT_PATH_ENV)
            .map(|value| env::split_paths(&value).filter(|path| !path.as_os_str().is_empty()).collect())
            .unwrap_or_default();
        Self { entry, script_paths }
    }
}
