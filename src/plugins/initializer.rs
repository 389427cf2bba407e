//! Backend client construction
//!
//! The loader asks a [`PluginInitializer`] for every accepted plugin's
//! backend client. Plugins without a backend get none.

use super::backend::{BackendPlugin, ProcessBackend};
use super::plugin::Plugin;
use super::{PluginError, PluginResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Builds the backend client of a loaded plugin
#[cfg_attr(test, mockall::automock)]
pub trait PluginInitializer: Send + Sync {
    fn initialize(&self, plugin: &Plugin) -> PluginResult<Option<Arc<dyn BackendPlugin>>>;
}

/// Factory for an in-process backend
pub type BackendFactory =
    Arc<dyn Fn(&Plugin) -> PluginResult<Arc<dyn BackendPlugin>> + Send + Sync>;

/// Default initializer
///
/// Factories registered for a plugin ID win; otherwise a backend plugin with
/// an `executable` is run as a managed child process.
#[derive(Default, Clone)]
pub struct BackendInitializer {
    factories: HashMap<String, BackendFactory>,
}

impl BackendInitializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `plugin_id` from an in-process backend instead of an executable
    pub fn with_factory<F>(mut self, plugin_id: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Plugin) -> PluginResult<Arc<dyn BackendPlugin>> + Send + Sync + 'static,
    {
        self.factories.insert(plugin_id.into(), Arc::new(factory));
        self
    }
}

impl PluginInitializer for BackendInitializer {
    fn initialize(&self, plugin: &Plugin) -> PluginResult<Option<Arc<dyn BackendPlugin>>> {
        if let Some(factory) = self.factories.get(plugin.id()) {
            tracing::debug!(plugin_id = %plugin.id(), "Using in-process backend");
            return factory(plugin).map(Some);
        }

        let manifest = plugin.manifest();
        if !manifest.backend {
            return Ok(None);
        }

        let Some(executable) = manifest.executable.as_deref() else {
            return Err(PluginError::Initialize {
                plugin_id: plugin.id().to_string(),
                message: "backend plugin declares no executable".to_string(),
            });
        };

        let backend = ProcessBackend::for_plugin(plugin.id(), plugin.dir(), executable);
        tracing::debug!(
            plugin_id = %plugin.id(),
            program = %backend.program().display(),
            "Using process backend"
        );
        Ok(Some(Arc::new(backend)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::backend::{BackendResult, ExitSignal, ProcessStatus};
    use crate::plugins::manifest::{PluginManifest, PluginType};
    use crate::plugins::plugin::PluginClass;
    use async_trait::async_trait;
    use std::path::PathBuf;

    fn plugin(id: &str, backend: bool, executable: Option<&str>) -> Plugin {
        let manifest = PluginManifest {
            id: id.to_string(),
            plugin_type: "datasource".to_string(),
            backend,
            executable: executable.map(str::to_string),
            ..Default::default()
        };
        Plugin::new(
            manifest,
            PluginType::DataSource,
            PathBuf::from(format!("/plugins/{}", id)),
            PluginClass::External,
        )
    }

    struct InProcess {
        status: ProcessStatus,
    }

    #[async_trait]
    impl BackendPlugin for InProcess {
        fn plugin_id(&self) -> &str {
            "in-process"
        }
        fn is_managed(&self) -> bool {
            false
        }
        fn exited(&self) -> bool {
            self.status.exited()
        }
        fn exit_signal(&self) -> ExitSignal {
            self.status.subscribe()
        }
        fn decommission(&self) {
            self.status.decommission()
        }
        fn is_decommissioned(&self) -> bool {
            self.status.is_decommissioned()
        }
        async fn start(&self) -> BackendResult<()> {
            Ok(())
        }
        async fn stop(&self) -> BackendResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_frontend_only_plugin_has_no_client() {
        let client = BackendInitializer::new()
            .initialize(&plugin("panel", false, None))
            .unwrap();
        assert!(client.is_none());
    }

    #[test]
    fn test_backend_plugin_gets_managed_process() {
        let client = BackendInitializer::new()
            .initialize(&plugin("test-ds", true, Some("gpx_test")))
            .unwrap()
            .unwrap();
        assert!(client.is_managed());
        assert_eq!(client.plugin_id(), "test-ds");
    }

    #[test]
    fn test_backend_without_executable_fails() {
        let err = BackendInitializer::new()
            .initialize(&plugin("test-ds", true, None))
            .err()
            .unwrap();
        assert!(matches!(err, PluginError::Initialize { .. }));
    }

    #[test]
    fn test_factory_takes_precedence() {
        let init = BackendInitializer::new().with_factory("test-ds", |_| {
            Ok(Arc::new(InProcess {
                status: ProcessStatus::new(),
            }) as Arc<dyn BackendPlugin>)
        });
        let client = init
            .initialize(&plugin("test-ds", true, None))
            .unwrap()
            .unwrap();
        assert!(!client.is_managed());
        assert_eq!(client.plugin_id(), "in-process");
    }
}
