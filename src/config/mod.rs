//! Configuration system for plugvisor
//!
//! Layered YAML configuration: built-in defaults, the root `config.yaml`,
//! an optional file given on the command line, and environment overrides.

mod defaults;
pub mod loader;
pub mod paths;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{Config, LoggerConfig};

use anyhow::Context;
use std::path::PathBuf;

/// Keys accepted by `config get` and `config set`
pub const CONFIG_KEYS: &[&str] = &[
    "paths.plugins",
    "paths.bundledPlugins",
    "paths.staticRoot",
    "allowLoadingUnsignedPlugins",
    "supervisor.restartDelayMs",
    "supervisor.dispatchTimeoutSecs",
    "installer.repoUrl",
    "logger.level",
    "logger.file",
];

fn optional_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

/// Get a configuration value by key (dot notation)
pub fn get_config_value(config: &Config, key: &str) -> anyhow::Result<String> {
    match key {
        "paths.plugins" => Ok(config.paths.plugins.display().to_string()),
        "paths.bundledPlugins" => Ok(optional_path(&config.paths.bundled_plugins)),
        "paths.staticRoot" => Ok(optional_path(&config.paths.static_root)),
        "allowLoadingUnsignedPlugins" => Ok(config.allow_loading_unsigned_plugins.join(",")),
        "supervisor.restartDelayMs" => Ok(config.supervisor.restart_delay_ms.to_string()),
        "supervisor.dispatchTimeoutSecs" => {
            Ok(config.supervisor.dispatch_timeout_secs.to_string())
        }
        "installer.repoUrl" => Ok(config.installer.repo_url.clone()),
        "logger.level" => Ok(config.logger.level.clone()),
        "logger.file" => Ok(optional_path(&config.logger.file)),
        _ => Err(anyhow::anyhow!("Unknown configuration key: {}", key)),
    }
}

/// Set a configuration value by key (dot notation)
///
/// An empty value clears optional keys.
pub fn set_config_value(config: &mut Config, key: &str, value: &str) -> anyhow::Result<()> {
    let optional = |value: &str| (!value.is_empty()).then(|| PathBuf::from(value));

    match key {
        "paths.plugins" => {
            if value.is_empty() {
                return Err(anyhow::anyhow!("paths.plugins must not be empty"));
            }
            config.paths.plugins = PathBuf::from(value);
        }
        "paths.bundledPlugins" => config.paths.bundled_plugins = optional(value),
        "paths.staticRoot" => config.paths.static_root = optional(value),
        "allowLoadingUnsignedPlugins" => {
            // YAML array or comma-separated list
            config.allow_loading_unsigned_plugins = if value.trim_start().starts_with('[') {
                serde_yaml::from_str(value).context(
                    "allowLoadingUnsignedPlugins must be a YAML array (e.g., ['app-a', 'app-b'])",
                )?
            } else {
                value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            };
        }
        "supervisor.restartDelayMs" => {
            config.supervisor.restart_delay_ms = value
                .parse()
                .context("supervisor.restartDelayMs must be a number")?;
        }
        "supervisor.dispatchTimeoutSecs" => {
            let secs: u64 = value
                .parse()
                .context("supervisor.dispatchTimeoutSecs must be a number")?;
            if secs == 0 {
                return Err(anyhow::anyhow!(
                    "supervisor.dispatchTimeoutSecs must be greater than 0"
                ));
            }
            config.supervisor.dispatch_timeout_secs = secs;
        }
        "installer.repoUrl" => config.installer.repo_url = value.to_string(),
        "logger.level" => {
            tracing_subscriber::EnvFilter::try_new(value)
                .with_context(|| format!("Invalid log level: {}", value))?;
            config.logger.level = value.to_string();
        }
        "logger.file" => config.logger.file = optional(value),
        _ => return Err(anyhow::anyhow!("Unknown configuration key: {}", key)),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_key_round_trips_through_get() {
        let config = Config::default();
        for key in CONFIG_KEYS {
            assert!(get_config_value(&config, key).is_ok(), "{}", key);
        }
        assert!(get_config_value(&config, "nope").is_err());
    }

    #[test]
    fn test_set_values() {
        let mut config = Config::default();
        set_config_value(&mut config, "paths.staticRoot", "/srv/public").unwrap();
        set_config_value(&mut config, "supervisor.restartDelayMs", "250").unwrap();
        set_config_value(&mut config, "allowLoadingUnsignedPlugins", "a, b,,c").unwrap();

        assert_eq!(get_config_value(&config, "paths.staticRoot").unwrap(), "/srv/public");
        assert_eq!(config.supervisor.restart_delay_ms, 250);
        assert_eq!(config.allow_loading_unsigned_plugins, vec!["a", "b", "c"]);

        set_config_value(&mut config, "allowLoadingUnsignedPlugins", "['x']").unwrap();
        assert_eq!(config.allow_loading_unsigned_plugins, vec!["x"]);

        set_config_value(&mut config, "paths.staticRoot", "").unwrap();
        assert!(config.paths.static_root.is_none());
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = Config::default();
        assert!(set_config_value(&mut config, "supervisor.restartDelayMs", "soon").is_err());
        assert!(set_config_value(&mut config, "supervisor.dispatchTimeoutSecs", "0").is_err());
        assert!(set_config_value(&mut config, "paths.plugins", "").is_err());
        assert!(set_config_value(&mut config, "readOnly", "true").is_err());
    }
}
