use crate::executor::Escalation;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level ryzenctl configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub executor: ExecutorConfig,
    pub integration: IntegrationConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// ryzenadj binary name or absolute path.
    pub binary: String,
    /// How to gain root when not already running as root.
    pub escalation: Escalation,
    /// Per-invocation limit; the child is killed after this many seconds.
    pub timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            binary: "ryzenadj".to_string(),
            escalation: Escalation::Pkexec,
            timeout_secs: 10,
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    /// Rebind enabled hooks to whatever profile was applied last.
    pub auto_sync: bool,
    /// Command written into hook files. Defaults to this executable.
    pub program: Option<String>,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            auto_sync: true,
            program: None,
        }
    }
}

impl IntegrationConfig {
    pub fn program(&self) -> String {
        if let Some(program) = &self.program {
            return program.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|p| p.to_str().map(str::to_string))
            .unwrap_or_else(|| "/usr/bin/ryzenctl".to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub state_file: Option<PathBuf>,
}

impl StorageConfig {
    /// `~/.config/ryzenctl/state.json` unless overridden.
    pub fn state_file(&self) -> PathBuf {
        if let Some(path) = &self.state_file {
            return path.clone();
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ryzenctl")
            .join("state.json")
    }
}

const SYSTEM_CONFIG: &str = "/etc/ryzenctl/config.toml";

fn read_toml(path: &Path) -> Option<toml::Value> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("ignoring unparsable config at {}: {}", path.display(), e);
            None
        }
    }
}

fn load_system() -> Option<toml::Value> {
    read_toml(Path::new(SYSTEM_CONFIG))
}

/// ~/.config/ryzenctl/config.toml
fn load_user() -> Option<toml::Value> {
    let dir = dirs::config_dir()?;
    read_toml(&dir.join("ryzenctl").join("config.toml"))
}

/// Tables are merged key-by-key; anything else in `overlay` replaces `base`.
fn merge_values(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_values(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

fn load_from_path(path: &Path) -> AppConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            warn!("failed to parse config at {}: {}", path.display(), e);
            AppConfig::default()
        }),
        Err(e) => {
            warn!("failed to read config at {}: {}", path.display(), e);
            AppConfig::default()
        }
    }
}

/// System file first, then the user file on top. An explicit
/// `override_path` replaces both.
pub fn load(override_path: Option<&Path>) -> AppConfig {
    if let Some(path) = override_path {
        return load_from_path(path);
    }

    let merged = match (load_system(), load_user()) {
        (Some(s), Some(u)) => Some(merge_values(s, u)),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    };

    match merged {
        Some(value) => value.try_into().unwrap_or_else(|e| {
            warn!("failed to deserialize config: {}", e);
            AppConfig::default()
        }),
        None => AppConfig::default(),
    }
}
