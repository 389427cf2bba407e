//! plugvisor - plugin loader and backend supervisor
//!
//! Discovers plugins on disk, checks their signatures, and keeps their
//! backend processes running until shutdown.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plugvisor::cli::{self, ConfigSubcommand};
use plugvisor::config::ConfigLoader;
use std::path::PathBuf;

/// plugvisor - plugin loader and backend supervisor
#[derive(Parser, Debug)]
#[command(name = "plugvisor", version)]
#[command(about = "Load plugins and supervise their backend processes", long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(long, short = 'd', global = true)]
    debug: bool,

    /// Additional configuration file, applied over the root config
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Main commands
#[derive(Subcommand, Debug)]
enum Command {
    /// Load all plugins and supervise their backends until Ctrl-C
    Run,
    /// List loaded plugins
    List,
    /// Validate the plugin in a directory
    Validate {
        /// Plugin directory containing plugin.json
        dir: PathBuf,
    },
    /// Install a plugin into the plugins directory
    Install {
        id: String,
        version: String,
        /// Package directory or file:// URL; defaults to the configured repository
        #[arg(long)]
        package: Option<String>,
    },
    /// Uninstall an external plugin
    Uninstall { id: String },
    /// Replace an installed plugin with another version
    Update { id: String, version: String },
    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let extra = args.config.as_deref();

    // Config commands must work even when the config is broken
    if let Command::Config { subcommand } = args.command {
        return cli::handle_config_command(subcommand, extra);
    }

    let config = ConfigLoader::load(extra).context("Failed to load configuration")?;

    let log_file = cli::init_logging(&config.logger, args.debug)?;
    if let Some(ref log_path) = log_file {
        eprintln!("Logs written to: {}", log_path.display());
    }
    tracing::debug!(
        plugins = %config.paths.plugins.display(),
        "Configuration loaded"
    );

    match args.command {
        Command::Run => cli::plugin::run(&config).await,
        Command::List => cli::plugin::list(&config).await,
        Command::Validate { dir } => cli::plugin::validate(&dir),
        Command::Install {
            id,
            version,
            package,
        } => cli::plugin::install(&config, &id, &version, package).await,
        Command::Uninstall { id } => cli::plugin::uninstall(&config, &id).await,
        Command::Update { id, version } => cli::plugin::update(&config, &id, &version).await,
        Command::Config { .. } => Ok(()),
    }
}
