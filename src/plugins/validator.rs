//! Plugin manifest validation
//!
//! Rejects manifests that cannot be turned into a plugin descriptor and gives
//! helpful error messages for the common mistakes.

use super::manifest::{PluginInclude, PluginManifest};
use super::{PluginError, PluginResult};
use std::collections::HashSet;

/// Include types a manifest may declare
const INCLUDE_TYPES: &[&str] = &["dashboard", "page", "panel", "datasource"];

/// Plugin manifest validator
pub struct PluginValidator;

impl PluginValidator {
    /// Validate a plugin manifest
    pub fn validate(manifest: &PluginManifest) -> PluginResult<()> {
        Self::validate_id(&manifest.id)?;
        Self::validate_type(&manifest.plugin_type)?;
        Self::validate_executable(manifest)?;
        Self::validate_includes(&manifest.includes)?;
        Self::validate_dependencies(manifest)?;
        Ok(())
    }

    /// Validate plugin ID
    fn validate_id(id: &str) -> PluginResult<()> {
        if id.is_empty() {
            return Err(PluginError::InvalidManifest(
                "Plugin id cannot be empty".to_string(),
            ));
        }

        // IDs end up in URLs and directory names
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(PluginError::InvalidManifest(format!(
                "Plugin id '{}' contains invalid characters. Use only alphanumeric, hyphens, underscores, and dots",
                id
            )));
        }

        Ok(())
    }

    /// Validate plugin type
    fn validate_type(plugin_type: &str) -> PluginResult<()> {
        if plugin_type.is_empty() {
            return Err(PluginError::InvalidManifest(
                "Plugin type cannot be empty".to_string(),
            ));
        }

        if super::manifest::PluginType::parse(plugin_type).is_none() {
            return Err(PluginError::InvalidManifest(format!(
                "Unknown plugin type '{}'. Expected one of: datasource, panel, app",
                plugin_type
            )));
        }

        Ok(())
    }

    fn validate_executable(manifest: &PluginManifest) -> PluginResult<()> {
        if let Some(executable) = &manifest.executable {
            if executable.trim().is_empty() {
                return Err(PluginError::InvalidManifest(format!(
                    "Plugin '{}' declares an empty executable",
                    manifest.id
                )));
            }
            if executable.contains('/') || executable.contains('\\') {
                return Err(PluginError::InvalidManifest(format!(
                    "Plugin '{}' executable '{}' must be a file name inside the plugin directory",
                    manifest.id, executable
                )));
            }
        }
        Ok(())
    }

    /// Validate includes
    fn validate_includes(includes: &[PluginInclude]) -> PluginResult<()> {
        let mut seen = HashSet::new();

        for include in includes {
            if include.name.is_empty() {
                return Err(PluginError::InvalidManifest(
                    "Include name cannot be empty".to_string(),
                ));
            }

            if !INCLUDE_TYPES.contains(&include.include_type.as_str()) {
                return Err(PluginError::InvalidManifest(format!(
                    "Include '{}' has unknown type '{}'",
                    include.name, include.include_type
                )));
            }

            if !seen.insert((&include.include_type, &include.name)) {
                return Err(PluginError::InvalidManifest(format!(
                    "Duplicate {} include '{}'",
                    include.include_type, include.name
                )));
            }
        }

        Ok(())
    }

    fn validate_dependencies(manifest: &PluginManifest) -> PluginResult<()> {
        for dep in &manifest.dependencies.plugins {
            if dep.id.is_empty() {
                return Err(PluginError::InvalidManifest(
                    "Plugin dependency id cannot be empty".to_string(),
                ));
            }
            if dep.id == manifest.id {
                return Err(PluginError::InvalidManifest(format!(
                    "Plugin '{}' cannot depend on itself",
                    manifest.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::manifest::PluginDependency;

    fn create_valid_manifest() -> PluginManifest {
        PluginManifest {
            id: "test-app".to_string(),
            plugin_type: "app".to_string(),
            name: "Test App".to_string(),
            includes: vec![PluginInclude {
                name: "Nginx Connections".to_string(),
                include_type: "dashboard".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_manifest() {
        let manifest = create_valid_manifest();
        assert!(PluginValidator::validate(&manifest).is_ok());
    }

    #[test]
    fn test_empty_id() {
        let mut manifest = create_valid_manifest();
        manifest.id = "".to_string();
        let result = PluginValidator::validate(&manifest);
        assert!(matches!(result, Err(PluginError::InvalidManifest(_))));
        assert!(result.unwrap_err().to_string().contains("id cannot be empty"));
    }

    #[test]
    fn test_invalid_id() {
        let mut manifest = create_valid_manifest();
        manifest.id = "test@plugin!".to_string();
        let result = PluginValidator::validate(&manifest);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("invalid characters")
        );
    }

    #[test]
    fn test_unknown_type() {
        let mut manifest = create_valid_manifest();
        manifest.plugin_type = "widget".to_string();
        let result = PluginValidator::validate(&manifest);
        assert!(result.unwrap_err().to_string().contains("Unknown plugin type"));
    }

    #[test]
    fn test_empty_type() {
        let mut manifest = create_valid_manifest();
        manifest.plugin_type = "".to_string();
        assert!(PluginValidator::validate(&manifest).is_err());
    }

    #[test]
    fn test_executable_must_be_a_file_name() {
        let mut manifest = create_valid_manifest();
        manifest.executable = Some("../bin/evil".to_string());
        assert!(PluginValidator::validate(&manifest).is_err());

        manifest.executable = Some(" ".to_string());
        assert!(PluginValidator::validate(&manifest).is_err());

        manifest.executable = Some("gpx_test".to_string());
        assert!(PluginValidator::validate(&manifest).is_ok());
    }

    #[test]
    fn test_unknown_include_type() {
        let mut manifest = create_valid_manifest();
        manifest.includes[0].include_type = "widget".to_string();
        let result = PluginValidator::validate(&manifest);
        assert!(result.unwrap_err().to_string().contains("unknown type"));
    }

    #[test]
    fn test_duplicate_includes() {
        let mut manifest = create_valid_manifest();
        let dup = manifest.includes[0].clone();
        manifest.includes.push(dup);
        let result = PluginValidator::validate(&manifest);
        assert!(result.unwrap_err().to_string().contains("Duplicate dashboard"));
    }

    #[test]
    fn test_self_dependency() {
        let mut manifest = create_valid_manifest();
        manifest.dependencies.plugins.push(PluginDependency {
            id: "test-app".to_string(),
            ..Default::default()
        });
        let result = PluginValidator::validate(&manifest);
        assert!(result.unwrap_err().to_string().contains("depend on itself"));
    }
}
