//! Plugin loader
//!
//! Turns plugin roots on disk into a batch of descriptors: finds manifests,
//! parses and validates them, classifies each plugin, checks signatures,
//! builds backend clients, and links nested plugins to their parent.
//!
//! One bad plugin never aborts the batch; its error is recorded under the
//! plugin directory and loading continues.

use super::finder::{Finder, resolve_path};
use super::initializer::{BackendInitializer, PluginInitializer};
use super::manifest::PluginManifest;
use super::plugin::{Plugin, PluginClass, classify};
use super::signature::{ManifestDigestValidator, SignatureInfo, SignaturePolicy, SignatureValidator};
use super::validator::PluginValidator;
use super::{PluginError, PluginResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Result of one load pass
#[derive(Debug, Default)]
pub struct LoadedBatch {
    /// Accepted plugins in discovery order
    pub plugins: Vec<Plugin>,
    /// Per-plugin failures keyed by plugin directory
    pub errors: BTreeMap<PathBuf, PluginError>,
}

impl LoadedBatch {
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty() && self.errors.is_empty()
    }
}

/// Anything that can produce a batch of plugins
pub trait PluginSource: Send + Sync {
    /// Load every plugin under `paths`, skipping IDs in `already_known`
    fn load(&self, paths: &[PathBuf], already_known: &HashSet<String>) -> PluginResult<LoadedBatch>;
}

/// Directories that decide a plugin's class
#[derive(Debug, Clone, Default)]
pub struct PluginRoots {
    /// Host static root; core plugins live in `<static_root>/app/plugins`
    pub static_root: Option<PathBuf>,
    pub bundled: Option<PathBuf>,
    pub plugins: Option<PathBuf>,
}

impl PluginRoots {
    pub fn core_dir(&self) -> Option<PathBuf> {
        self.static_root
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|root| root.join("app").join("plugins"))
    }

    /// Roots as they resolve on disk right now
    ///
    /// A root created after the loader was built (the plugins directory on
    /// first start) only canonicalises once it exists, so this runs per load.
    fn resolve(&self) -> ResolvedRoots {
        let resolve = |p: Option<&PathBuf>| {
            p.filter(|p| !p.as_os_str().is_empty())
                .map(|p| resolve_path(p))
        };

        ResolvedRoots {
            core: resolve(self.core_dir().as_ref()),
            bundled: resolve(self.bundled.as_ref()),
            plugins: resolve(self.plugins.as_ref()),
        }
    }
}

struct ResolvedRoots {
    core: Option<PathBuf>,
    bundled: Option<PathBuf>,
    plugins: Option<PathBuf>,
}

impl ResolvedRoots {
    fn class_of(&self, dir: &Path) -> PluginClass {
        classify(
            dir,
            self.core.as_deref(),
            self.bundled.as_deref(),
            self.plugins.as_deref(),
        )
    }
}

/// Plugin loader
pub struct Loader {
    finder: Finder,
    roots: PluginRoots,
    signature_validator: Arc<dyn SignatureValidator>,
    signature_policy: SignaturePolicy,
    initializer: Arc<dyn PluginInitializer>,
}

impl Loader {
    /// Create a loader with the default signature validator and initializer
    pub fn new(roots: PluginRoots) -> Self {
        Self {
            finder: Finder::new(),
            roots,
            signature_validator: Arc::new(ManifestDigestValidator::new()),
            signature_policy: SignaturePolicy::default(),
            initializer: Arc::new(BackendInitializer::new()),
        }
    }

    pub fn with_signature_validator(mut self, validator: Arc<dyn SignatureValidator>) -> Self {
        self.signature_validator = validator;
        self
    }

    pub fn with_signature_policy(mut self, policy: SignaturePolicy) -> Self {
        self.signature_policy = policy;
        self
    }

    pub fn with_initializer(mut self, initializer: Arc<dyn PluginInitializer>) -> Self {
        self.initializer = initializer;
        self
    }

    /// Read and parse a single manifest file
    pub fn read_manifest(path: &Path) -> PluginResult<PluginManifest> {
        tracing::debug!("Loading plugin manifest from: {:?}", path);

        let content = std::fs::read_to_string(path).map_err(|e| PluginError::io(path, e))?;

        serde_json::from_str(&content).map_err(|e| PluginError::ManifestParse {
            path: path.to_path_buf(),
            source: Arc::new(e),
        })
    }

    /// Class a resolved plugin directory belongs to
    pub fn class_of(&self, dir: &Path) -> PluginClass {
        self.roots.resolve().class_of(dir)
    }

    /// Load all plugins under `paths`
    ///
    /// Only a root that cannot be read fails the whole call.
    pub fn load(
        &self,
        paths: &[PathBuf],
        already_known: &HashSet<String>,
    ) -> PluginResult<LoadedBatch> {
        let mut errors = BTreeMap::new();
        let mut seen_dirs = HashSet::new();
        let mut ids: HashMap<String, PathBuf> = HashMap::new();
        let mut plugins = Vec::new();
        let roots = self.roots.resolve();

        for root in paths {
            for manifest_path in self.finder.find(root)? {
                let Some(dir) = manifest_path.parent().map(resolve_path) else {
                    continue;
                };
                if !seen_dirs.insert(dir.clone()) {
                    tracing::debug!("Skipping already loaded plugin directory: {:?}", dir);
                    continue;
                }

                match self.load_candidate(&manifest_path, &dir, &roots, already_known, &ids) {
                    Ok(Some(plugin)) => {
                        ids.insert(plugin.id().to_string(), dir);
                        plugins.push(plugin);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!("Failed to load plugin {:?}: {}", dir, e);
                        errors.insert(dir, e);
                    }
                }
            }
        }

        link_nested(&mut plugins);
        self.signature_policy.apply(&mut plugins);

        if !errors.is_empty() {
            tracing::warn!(
                "Loaded {} plugins with {} errors",
                plugins.len(),
                errors.len()
            );
        } else if !plugins.is_empty() {
            tracing::info!(
                "Successfully loaded {} plugin(s): {}",
                plugins.len(),
                plugins
                    .iter()
                    .map(|p| p.id())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        } else {
            tracing::debug!("No plugins found in {:?}", paths);
        }

        Ok(LoadedBatch { plugins, errors })
    }

    /// Build one unlinked descriptor; `Ok(None)` means deliberately skipped
    fn load_candidate(
        &self,
        manifest_path: &Path,
        dir: &Path,
        roots: &ResolvedRoots,
        already_known: &HashSet<String>,
        batch_ids: &HashMap<String, PathBuf>,
    ) -> PluginResult<Option<Plugin>> {
        let manifest = Self::read_manifest(manifest_path)?;
        PluginValidator::validate(&manifest)?;

        let Some(plugin_type) = manifest.kind() else {
            return Err(PluginError::InvalidManifest(format!(
                "Unknown plugin type '{}'",
                manifest.plugin_type
            )));
        };

        if already_known.contains(&manifest.id) {
            tracing::debug!(plugin_id = %manifest.id, "Skipping plugin that is already registered");
            return Ok(None);
        }

        if let Some(existing) = batch_ids.get(&manifest.id) {
            return Err(PluginError::Duplicate {
                plugin_id: manifest.id.clone(),
                existing_dir: existing.clone(),
            });
        }

        let class = roots.class_of(dir);
        let signature = if class == PluginClass::Core {
            SignatureInfo::internal()
        } else {
            self.signature_validator.validate(dir, &manifest)?
        };

        let mut plugin = Plugin::new(manifest, plugin_type, dir.to_path_buf(), class)
            .with_signature(signature);

        let client = self.initializer.initialize(&plugin)?;
        plugin.set_client(client);

        tracing::debug!(
            plugin_id = %plugin.id(),
            class = %plugin.class(),
            signature = %plugin.signature_status(),
            "Plugin '{}' loaded",
            plugin.id()
        );

        Ok(Some(plugin))
    }
}

impl PluginSource for Loader {
    fn load(&self, paths: &[PathBuf], already_known: &HashSet<String>) -> PluginResult<LoadedBatch> {
        Loader::load(self, paths, already_known)
    }
}

/// Link every plugin to the outermost plugin whose directory contains it
fn link_nested(plugins: &mut [Plugin]) {
    let dirs: Vec<(String, PathBuf)> = plugins
        .iter()
        .map(|p| (p.id().to_string(), p.dir().to_path_buf()))
        .collect();

    let mut links = Vec::new();
    for (child_idx, (child_id, child_dir)) in dirs.iter().enumerate() {
        let outermost = dirs
            .iter()
            .enumerate()
            .filter(|(idx, (_, dir))| *idx != child_idx && dir != child_dir && child_dir.starts_with(dir))
            .min_by_key(|(_, (_, dir))| dir.components().count());

        if let Some((parent_idx, (parent_id, _))) = outermost {
            links.push((parent_idx, child_idx, parent_id.clone(), child_id.clone()));
        }
    }

    for (parent_idx, child_idx, parent_id, child_id) in links {
        tracing::debug!(parent = %parent_id, child = %child_id, "Linking nested plugin");
        plugins[child_idx].set_parent(parent_id);
        plugins[parent_idx].add_child(child_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::initializer::MockPluginInitializer;
    use crate::plugins::signature::{MockSignatureValidator, SignatureStatus, SignatureType};
    use std::fs;

    fn write_plugin(dir: &Path, json: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("plugin.json"), json).unwrap();
    }

    fn manifest_json(id: &str, plugin_type: &str) -> String {
        format!(
            r#"{{ "id": "{}", "type": "{}", "name": "{}", "info": {{ "version": "1.0.0" }} }}"#,
            id, plugin_type, id
        )
    }

    fn valid_validator() -> Arc<dyn SignatureValidator> {
        let mut mock = MockSignatureValidator::new();
        mock.expect_validate()
            .returning(|_, _| Ok(SignatureInfo::valid(SignatureType::FirstParty, "Grafana Labs")));
        Arc::new(mock)
    }

    #[test]
    fn test_read_manifest_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(dir.path(), "{ not json");
        let err = Loader::read_manifest(&dir.path().join("plugin.json")).unwrap_err();
        assert!(matches!(err, PluginError::ManifestParse { .. }));
    }

    #[test]
    fn test_core_plugin_is_internal_and_skips_validator() {
        let root = tempfile::tempdir().unwrap();
        let plugin_dir = root.path().join("app/plugins/datasource/cloudwatch");
        write_plugin(&plugin_dir, &manifest_json("cloudwatch", "datasource"));

        let mut validator = MockSignatureValidator::new();
        validator.expect_validate().never();

        let loader = Loader::new(PluginRoots {
            static_root: Some(root.path().to_path_buf()),
            ..Default::default()
        })
        .with_signature_validator(Arc::new(validator));

        let batch = loader.load(&[plugin_dir], &HashSet::new()).unwrap();
        assert_eq!(batch.plugins.len(), 1);
        let plugin = &batch.plugins[0];
        assert_eq!(plugin.class(), PluginClass::Core);
        assert_eq!(plugin.signature_status(), SignatureStatus::Internal);
        assert!(plugin.signature_error().is_none());
        assert_eq!(plugin.module(), "app/plugins/datasource/cloudwatch/module");
    }

    #[test]
    fn test_initializer_failure_drops_plugin() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(&root.path().join("good"), &manifest_json("good", "panel"));
        write_plugin(&root.path().join("bad"), &manifest_json("bad", "panel"));

        let mut init = MockPluginInitializer::new();
        init.expect_initialize().returning(|p| {
            if p.id() == "bad" {
                Err(PluginError::Initialize {
                    plugin_id: "bad".to_string(),
                    message: "boom".to_string(),
                })
            } else {
                Ok(None)
            }
        });

        let loader = Loader::new(PluginRoots {
            plugins: Some(root.path().to_path_buf()),
            ..Default::default()
        })
        .with_signature_validator(valid_validator())
        .with_initializer(Arc::new(init));

        let batch = loader
            .load(&[root.path().to_path_buf()], &HashSet::new())
            .unwrap();
        assert_eq!(batch.plugins.len(), 1);
        assert_eq!(batch.plugins[0].id(), "good");

        let bad_dir = resolve_path(&root.path().join("bad"));
        assert!(matches!(
            batch.errors.get(&bad_dir),
            Some(PluginError::Initialize { .. })
        ));
    }

    #[test]
    fn test_link_outermost_ancestor() {
        let root = tempfile::tempdir().unwrap();
        let top = root.path().join("bundle");
        write_plugin(&top, &manifest_json("bundle-app", "app"));
        write_plugin(&top.join("datasource"), &manifest_json("bundle-ds", "datasource"));
        write_plugin(
            &top.join("datasource/panels/inner"),
            &manifest_json("bundle-panel", "panel"),
        );

        let loader = Loader::new(PluginRoots {
            plugins: Some(root.path().to_path_buf()),
            ..Default::default()
        })
        .with_signature_validator(valid_validator());

        let batch = loader
            .load(&[root.path().to_path_buf()], &HashSet::new())
            .unwrap();
        let by_id: HashMap<_, _> = batch.plugins.iter().map(|p| (p.id(), p)).collect();

        assert_eq!(by_id["bundle-app"].parent(), None);
        assert_eq!(by_id["bundle-ds"].parent(), Some("bundle-app"));
        assert_eq!(by_id["bundle-panel"].parent(), Some("bundle-app"));

        let mut children = by_id["bundle-app"].children().to_vec();
        children.sort();
        assert_eq!(children, vec!["bundle-ds", "bundle-panel"]);
    }

    #[test]
    fn test_plain_file_root_loads_nothing() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("not-a-dir");
        fs::write(&file, "x").unwrap();

        let loader = Loader::new(PluginRoots::default());
        let batch = loader.load(&[file], &HashSet::new()).unwrap();
        assert!(batch.is_empty());
    }
}
