//! plugvisor
//!
//! Plugin loading and backend supervision for hosts that embed data-source,
//! panel and app plugins. The [`plugins`] module holds the loader and the
//! manager; [`config`] and [`cli`] back the `plugvisor` binary.

pub mod cli;
pub mod config;
pub mod plugins;

// Re-export commonly used types for convenience
pub use plugins::{
    Loader, Plugin, PluginClass, PluginError, PluginManager, PluginResult, PluginState,
    PluginType,
};
