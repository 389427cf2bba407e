//! Manifest discovery
//!
//! Walks a plugin root and returns every `plugin.json` beneath it.

use super::manifest::MANIFEST_FILE_NAME;
use super::{PluginError, PluginResult};
use std::path::{Component, Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Directories never searched for plugins
const SKIPPED_DIRS: &[&str] = &["node_modules"];

/// Plugin manifest finder
#[derive(Debug, Default, Clone)]
pub struct Finder;

impl Finder {
    pub fn new() -> Self {
        Self
    }

    /// Find all plugin manifests under `root`
    ///
    /// Symlinked directories are followed and filesystem loops skipped.
    /// Results are in file-name order. A missing root yields no manifests;
    /// only a root that exists but cannot be read is an error.
    pub fn find(&self, root: &Path) -> PluginResult<Vec<PathBuf>> {
        tracing::debug!("Searching for plugins in: {:?}", root);

        match std::fs::metadata(root) {
            Ok(meta) if meta.is_dir() => {
                std::fs::read_dir(root).map_err(|e| PluginError::io(root, e))?;
            }
            Ok(_) => {
                // A manifest path given directly
                if root.file_name().is_some_and(|n| n == MANIFEST_FILE_NAME) {
                    return Ok(vec![root.to_path_buf()]);
                }
                return Ok(vec![]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Plugin root does not exist: {:?}", root);
                return Ok(vec![]);
            }
            Err(e) => return Err(PluginError::io(root, e)),
        }

        let walker = WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !Self::is_skipped(e));

        let mut manifests = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if e.loop_ancestor().is_some() {
                        tracing::debug!("Skipping filesystem loop: {}", e);
                    } else {
                        tracing::warn!("Skipping unreadable path under {:?}: {}", root, e);
                    }
                    continue;
                }
            };

            if entry.file_type().is_file() && entry.file_name() == MANIFEST_FILE_NAME {
                manifests.push(entry.into_path());
            }
        }

        tracing::debug!("Found {} plugin manifest(s) in {:?}", manifests.len(), root);
        Ok(manifests)
    }

    fn is_skipped(entry: &DirEntry) -> bool {
        if !entry.file_type().is_dir() {
            return false;
        }
        let name = entry.file_name().to_string_lossy();
        name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref())
    }
}

/// Resolve a path for containment checks
///
/// Existing paths are canonicalised (resolving symlinks); others are made
/// absolute and normalised lexically.
pub fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
