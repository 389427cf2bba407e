//! Logging initialization

use crate::config::LoggerConfig;
use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Filter used when RUST_LOG is unset
fn default_filter(logger: &LoggerConfig, debug: bool) -> EnvFilter {
    let level = if debug { "debug" } else { logger.level.as_str() };
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize logging from the logger configuration
///
/// RUST_LOG wins over the configured level; `--debug` raises the configured
/// level to `debug`. Returns the log file path when logging to a file.
pub fn init_logging(logger: &LoggerConfig, debug: bool) -> Result<Option<PathBuf>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(logger, debug));

    match &logger.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create log directory: {}", parent.display())
                })?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;

            tracing_subscriber::fmt()
                .with_writer(std::sync::Mutex::new(file))
                .with_env_filter(filter)
                .with_ansi(false) // No ANSI codes in log file
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

            Ok(Some(path.clone()))
        }
        None => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .with_target(debug)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

            Ok(None)
        }
    }
}
