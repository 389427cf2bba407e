//! Configuration schema definitions
//!
//! Defines the structure of `config.yaml` using serde for serialization.

use crate::plugins::ManagerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Plugin directories
    #[serde(default)]
    pub paths: PathsConfig,

    /// Plugin IDs allowed to run without a valid signature
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_loading_unsigned_plugins: Vec<String>,

    /// Backend supervision
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub installer: InstallerConfig,

    /// Logger configuration
    #[serde(default)]
    pub logger: LoggerConfig,
}

/// Plugin directories
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PathsConfig {
    /// Where external plugins are installed
    #[serde(default = "default_plugins_path")]
    pub plugins: PathBuf,

    /// Plugins shipped with the host distribution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundled_plugins: Option<PathBuf>,

    /// Host static root; core plugins live in `<staticRoot>/app/plugins`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Delay between restart attempts of a crashed backend
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Upper bound of a single dispatch call
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InstallerConfig {
    /// Package repository used when an install names no package
    #[serde(default)]
    pub repo_url: String,
}

/// Logger configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoggerConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Write logs to this file instead of stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn default_plugins_path() -> PathBuf {
    PathBuf::from("data/plugins")
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_dispatch_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            plugins: default_plugins_path(),
            bundled_plugins: None,
            static_root: None,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: default_restart_delay_ms(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Settings for a [`PluginManager`](crate::plugins::PluginManager)
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            plugins_path: self.paths.plugins.clone(),
            bundled_plugins_path: self.paths.bundled_plugins.clone(),
            static_root: self.paths.static_root.clone(),
            restart_delay: Duration::from_millis(self.supervisor.restart_delay_ms),
            dispatch_timeout: Duration::from_secs(self.supervisor.dispatch_timeout_secs),
            repo_url: self.installer.repo_url.clone(),
            allow_unsigned: self.allow_loading_unsigned_plugins.clone(),
        }
    }
}
