// Plugin system for plugvisor
//
// Discovers plugin manifests on disk, classifies and signature-checks them,
// and supervises the backend processes of the plugins that have one.

pub mod backend;
pub mod finder;
pub mod initializer;
pub mod installer;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod plugin;
pub mod registry;
pub mod signature;
pub mod validator;

pub use backend::{BackendError, BackendPlugin, Capabilities};
pub use finder::Finder;
pub use initializer::{BackendInitializer, PluginInitializer};
pub use installer::{InstallOpts, Installer, LocalInstaller, UpdateInfo};
pub use loader::{LoadedBatch, Loader, PluginRoots, PluginSource};
pub use manager::{ManagerConfig, PluginErrorEntry, PluginManager, StaticRoute};
pub use manifest::{PluginManifest, PluginType};
pub use plugin::{Plugin, PluginClass, PluginState};
pub use registry::PluginRegistry;
pub use signature::{
    ManifestDigestValidator, SignatureError, SignatureInfo, SignaturePolicy, SignatureStatus,
    SignatureType, SignatureValidator,
};
pub use validator::PluginValidator;

use std::path::PathBuf;
use std::sync::Arc;

/// Plugin errors
///
/// Foreign error sources are held in `Arc` so the enum stays `Clone`; load
/// errors are kept per plugin directory and handed out more than once.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PluginError {
    #[error("Invalid plugin manifest: {0}")]
    InvalidManifest(String),

    #[error("Failed to parse plugin manifest {path:?}: {source}")]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: Arc<serde_json::Error>,
    },

    #[error("Plugin '{plugin_id}' is already registered from {existing_dir:?}")]
    Duplicate {
        plugin_id: String,
        existing_dir: PathBuf,
    },

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin is not installed: {0}")]
    NotInstalled(String),

    #[error("Plugin is not registered: {0}")]
    NotRegistered(String),

    #[error("Cannot uninstall a core or bundled plugin: {0}")]
    UninstallCorePlugin(String),

    #[error("Cannot uninstall plugin '{plugin_id}' located outside the plugins directory: {dir:?}")]
    UninstallOutsideOfPluginDir { plugin_id: String, dir: PathBuf },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("Failed to initialize plugin '{plugin_id}': {message}")]
    Initialize { plugin_id: String, message: String },

    #[error("Plugin installation failed: {0}")]
    Install(String),

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Plugin supervisor cancelled")]
    Cancelled,
}

impl PluginError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PluginError::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// True when the error is the normalised "capability not provided" error
    pub fn is_method_not_implemented(&self) -> bool {
        matches!(self, PluginError::Backend(BackendError::MethodNotImplemented))
    }
}

/// Result type for plugin operations
pub type PluginResult<T> = Result<T, PluginError>;
