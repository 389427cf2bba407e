//! Configuration loading and merging logic
//!
//! Handles loading configuration from multiple sources and merging them
//! according to precedence rules. Files are merged key by key, so a layer
//! only overrides the keys it sets.

use super::{defaults, paths, schema::Config};
use anyhow::{Context, Result};
use serde_yaml::Value;
use std::path::{Path, PathBuf};

/// Environment overrides, applied after every file layer
pub const ENV_PLUGINS_PATH: &str = "PLUGVISOR_PLUGINS_PATH";
pub const ENV_BUNDLED_PLUGINS_PATH: &str = "PLUGVISOR_BUNDLED_PLUGINS_PATH";
pub const ENV_STATIC_ROOT: &str = "PLUGVISOR_STATIC_ROOT";
pub const ENV_LOG_LEVEL: &str = "PLUGVISOR_LOG_LEVEL";

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with all layers merged
    ///
    /// Precedence order (highest to lowest):
    /// 1. Environment variable overrides
    /// 2. File given with `--config`
    /// 3. Root config
    /// 4. Built-in defaults
    pub fn load(extra: Option<&Path>) -> Result<Config> {
        let mut layers = Vec::new();

        let root = paths::root_config_path();
        if root.exists() {
            layers.push(Self::read_value(&root)?);
        }

        if let Some(path) = extra {
            if !path.exists() {
                return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
            }
            layers.push(Self::read_value(path)?);
        }

        let config = Self::merge_layers(Self::load_defaults(), layers)?;
        Ok(Self::apply_env_overrides(config, |key| std::env::var(key).ok()))
    }

    /// Load configuration from a single file
    pub fn load_file(path: &Path) -> Result<Config> {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration files and the merged result
    ///
    /// Fails on invalid YAML, unknown keys, wrong value types, unreadable
    /// files, and a zero dispatch timeout.
    pub fn validate(extra: Option<&Path>) -> Result<()> {
        let root = paths::root_config_path();
        if root.exists() {
            Self::load_file(&root)?;
        }
        if let Some(path) = extra {
            Self::load_file(path)?;
        }

        let config = Self::load(extra).context("Failed to load merged configuration")?;
        if config.supervisor.dispatch_timeout_secs == 0 {
            return Err(anyhow::anyhow!(
                "supervisor.dispatchTimeoutSecs must be greater than 0"
            ));
        }
        if config.paths.plugins.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("paths.plugins must not be empty"));
        }

        Ok(())
    }

    /// Load default configuration
    pub fn load_defaults() -> Config {
        defaults::default_config()
    }

    fn read_value(path: &Path) -> Result<Value> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        if contents.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Merge YAML layers onto `base`, later layers taking precedence
    fn merge_layers(base: Config, layers: Vec<Value>) -> Result<Config> {
        let mut merged =
            serde_yaml::to_value(&base).context("Failed to serialize configuration")?;
        for layer in layers {
            merge_value(&mut merged, layer);
        }
        serde_yaml::from_value(merged).context("Invalid configuration")
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(
        mut config: Config,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Config {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = non_empty(ENV_PLUGINS_PATH) {
            config.paths.plugins = PathBuf::from(path);
        }
        if let Some(path) = non_empty(ENV_BUNDLED_PLUGINS_PATH) {
            config.paths.bundled_plugins = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty(ENV_STATIC_ROOT) {
            config.paths.static_root = Some(PathBuf::from(path));
        }
        if let Some(level) = non_empty(ENV_LOG_LEVEL) {
            config.logger.level = level;
        }

        config
    }

    /// Save configuration to a file
    pub fn save(config: &Config, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            paths::ensure_dir(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let yaml =
            serde_yaml::to_string(config).context("Failed to serialize configuration to YAML")?;

        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Save root configuration
    pub fn save_root(config: &Config) -> Result<()> {
        Self::save(config, &paths::root_config_path())
    }
}

/// Deep-merge `overlay` into `base`; mappings merge, everything else replaces
fn merge_value(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
