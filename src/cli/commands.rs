//! Configuration command handlers

use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::Path;

use crate::config::{CONFIG_KEYS, ConfigLoader, get_config_value, paths, set_config_value};

/// Configuration management subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Get configuration value
    Get {
        /// Configuration key (e.g., "paths.plugins", "logger.level")
        key: Option<String>,
    },
    /// Set configuration value in the root config file
    Set {
        /// Configuration key (e.g., "paths.plugins", "logger.level")
        key: String,
        /// Configuration value; empty clears optional keys
        value: String,
    },
    /// List all configuration
    List,
    /// Show configuration file path
    Path,
    /// Validate configuration
    Validate,
}

/// Handle configuration subcommands
///
/// `extra` is the file given with `--config`; it is read but never written.
pub fn handle_config_command(cmd: ConfigSubcommand, extra: Option<&Path>) -> Result<()> {
    match cmd {
        ConfigSubcommand::Get { key } => {
            let config = ConfigLoader::load(extra).context("Failed to load configuration")?;

            if let Some(key) = key {
                let value = get_config_value(&config, &key).with_context(|| {
                    format!("Known keys: {}", CONFIG_KEYS.join(", "))
                })?;
                println!("{}", value);
            } else {
                let yaml =
                    serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
                print!("{}", yaml);
            }
        }
        ConfigSubcommand::Set { key, value } => {
            // Only the root file is edited, so env overrides never leak into it
            let root = paths::root_config_path();
            let mut config = if root.exists() {
                ConfigLoader::load_file(&root)?
            } else {
                ConfigLoader::load_defaults()
            };

            set_config_value(&mut config, &key, &value)
                .with_context(|| format!("Failed to set {} = {}", key, value))?;

            ConfigLoader::save_root(&config).context("Failed to save configuration")?;
            println!("Configuration saved");
        }
        ConfigSubcommand::List => {
            let config = ConfigLoader::load(extra).context("Failed to load configuration")?;
            let yaml =
                serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
            print!("{}", yaml);
        }
        ConfigSubcommand::Path => {
            println!("{}", paths::root_config_path().display());
        }
        ConfigSubcommand::Validate => {
            ConfigLoader::validate(extra).context("Configuration validation failed")?;
            println!("Configuration is valid");
        }
    }

    Ok(())
}
