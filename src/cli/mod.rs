//! CLI command handling module
//!
//! Handles all CLI subcommands and argument parsing.

mod commands;
mod logging;
pub mod plugin;

pub use commands::{ConfigSubcommand, handle_config_command};
pub use logging::*;
