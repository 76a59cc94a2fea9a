//! Configuration loading for the playbook CLI.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tw_core::orchestrator::EngineConfig;
use tw_observability::LoggingConfig;

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Engine limits and executor defaults.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Where playbook definitions are read from.
    #[serde(default)]
    pub playbooks: PlaybooksSettings,
}

impl AppConfig {
    /// Loads configuration from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Loads `path` if given, otherwise the default file if it exists,
    /// otherwise the built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Builds the logging configuration, forcing debug output when `verbose`.
    pub fn logging_config(&self, verbose: bool) -> Result<LoggingConfig> {
        let level = if verbose { "debug" } else { self.logging.level.as_str() };
        LoggingConfig::from_level_name(level, self.logging.json_format)
            .map_err(anyhow::Error::msg)
            .context("Invalid logging configuration")
    }
}

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "triage-playbooks.yaml";

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to emit JSON log lines.
    #[serde(default)]
    pub json_format: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

/// Playbook file location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybooksSettings {
    #[serde(default = "default_playbooks_path")]
    pub path: PathBuf,
}

fn default_playbooks_path() -> PathBuf {
    PathBuf::from("playbooks.yaml")
}

impl Default for PlaybooksSettings {
    fn default() -> Self {
        Self {
            path: default_playbooks_path(),
        }
    }
}
