//! Plugin registry
//!
//! Holds the registered plugins of one manager. Lookups hand out `Arc`s, so
//! the lock is never held while a caller talks to a plugin's backend.

use super::plugin::Plugin;
use super::{PluginError, PluginResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registered plugins keyed by ID
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Arc<Plugin>>>,
}

impl PluginRegistry {
    /// Create a new empty plugin registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin, rejecting an ID that is already present
    pub async fn insert(&self, plugin: Arc<Plugin>) -> PluginResult<()> {
        let mut plugins = self.plugins.write().await;
        if let Some(existing) = plugins.get(plugin.id()) {
            return Err(PluginError::Duplicate {
                plugin_id: plugin.id().to_string(),
                existing_dir: existing.dir().to_path_buf(),
            });
        }
        plugins.insert(plugin.id().to_string(), plugin);
        Ok(())
    }

    /// Get a plugin by ID
    pub async fn get(&self, id: &str) -> Option<Arc<Plugin>> {
        self.plugins.read().await.get(id).cloned()
    }

    /// Check if a plugin is registered
    pub async fn contains(&self, id: &str) -> bool {
        self.plugins.read().await.contains_key(id)
    }

    /// Remove a plugin by ID
    pub async fn remove(&self, id: &str) -> PluginResult<Arc<Plugin>> {
        self.plugins
            .write()
            .await
            .remove(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    /// All plugins, sorted by ID
    pub async fn plugins(&self) -> Vec<Arc<Plugin>> {
        let mut all: Vec<_> = self.plugins.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Registered plugin IDs
    pub async fn ids(&self) -> Vec<String> {
        self.plugins.read().await.keys().cloned().collect()
    }

    /// Get the number of registered plugins
    pub async fn len(&self) -> usize {
        self.plugins.read().await.len()
    }

    /// Check if the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.plugins.read().await.is_empty()
    }
}
