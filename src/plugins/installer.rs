//! Plugin package installation
//!
//! Downloading and unpacking plugin archives belongs to the host; the manager
//! only talks to an [`Installer`]. [`LocalInstaller`] serves packages that
//! are already unpacked on disk (a directory path or a `file://` URL).

use super::manifest::MANIFEST_FILE_NAME;
use super::{PluginError, PluginResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Where to install a plugin from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOpts {
    /// Explicit package location; when unset the repository is asked
    pub package_url: Option<String>,
    pub repo_url: String,
}

/// Location of the package for a newer plugin version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    pub package_url: String,
}

/// Installs and removes plugin packages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Installer: Send + Sync {
    /// Install `plugin_id` at `version` into `<plugins_dir>/<plugin_id>`
    async fn install(
        &self,
        plugin_id: &str,
        version: &str,
        plugins_dir: &Path,
        opts: &InstallOpts,
    ) -> PluginResult<()>;

    /// Remove an installed plugin directory
    async fn uninstall(&self, plugin_dir: &Path) -> PluginResult<()>;

    async fn get_update_info(
        &self,
        plugin_id: &str,
        version: &str,
        repo_url: &str,
    ) -> PluginResult<UpdateInfo>;
}

/// Installer for packages on the local filesystem
///
/// A repository is a directory laid out as `<repo>/<plugin_id>/<version>/`.
#[derive(Debug, Default, Clone)]
pub struct LocalInstaller;

impl LocalInstaller {
    pub fn new() -> Self {
        Self
    }

    /// Turn a package location into a local directory
    fn package_dir(location: &str) -> PluginResult<PathBuf> {
        match url::Url::parse(location) {
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map_err(|_| PluginError::Install(format!("Invalid file URL: {}", location))),
            // Single letters are Windows drive prefixes, not schemes
            Ok(url) if url.scheme().len() > 1 => Err(PluginError::Install(format!(
                "Unsupported package source '{}': only local paths and file:// URLs can be installed",
                location
            ))),
            _ => Ok(PathBuf::from(location)),
        }
    }

    fn repo_package(repo_url: &str, plugin_id: &str, version: &str) -> String {
        format!("{}/{}/{}", repo_url.trim_end_matches('/'), plugin_id, version)
    }

    fn copy_dir_all(src: &Path, dst: &Path) -> PluginResult<()> {
        for entry in WalkDir::new(src).follow_links(true) {
            let entry = entry.map_err(|e| {
                PluginError::Install(format!("Failed to read package {:?}: {}", src, e))
            })?;
            let rel = entry
                .path()
                .strip_prefix(src)
                .map_err(|e| PluginError::Install(e.to_string()))?;
            let target = dst.join(rel);

            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target).map_err(|e| PluginError::io(&target, e))?;
            } else {
                std::fs::copy(entry.path(), &target).map_err(|e| PluginError::io(&target, e))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Installer for LocalInstaller {
    async fn install(
        &self,
        plugin_id: &str,
        version: &str,
        plugins_dir: &Path,
        opts: &InstallOpts,
    ) -> PluginResult<()> {
        let location = opts
            .package_url
            .clone()
            .unwrap_or_else(|| Self::repo_package(&opts.repo_url, plugin_id, version));
        let source = Self::package_dir(&location)?;

        if !source.join(MANIFEST_FILE_NAME).is_file() {
            return Err(PluginError::Install(format!(
                "No {} found in package {:?}",
                MANIFEST_FILE_NAME, source
            )));
        }

        let target = plugins_dir.join(plugin_id);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Err(PluginError::Install(format!(
                "Plugin directory already exists: {:?}",
                target
            )));
        }

        tracing::info!(plugin_id, version, source = ?source, "Installing plugin");

        tokio::fs::create_dir_all(plugins_dir)
            .await
            .map_err(|e| PluginError::io(plugins_dir, e))?;

        // Stage under a hidden name so loaders never see a half-copied plugin
        let staging = tempfile::Builder::new()
            .prefix(".install-")
            .tempdir_in(plugins_dir)
            .map_err(|e| PluginError::io(plugins_dir, e))?;

        let staged = staging.path().to_path_buf();
        tokio::task::spawn_blocking(move || Self::copy_dir_all(&source, &staged))
            .await
            .map_err(|e| PluginError::Install(format!("Install task failed: {}", e)))??;

        tokio::fs::rename(staging.path(), &target)
            .await
            .map_err(|e| PluginError::io(&target, e))?;

        Ok(())
    }

    async fn uninstall(&self, plugin_dir: &Path) -> PluginResult<()> {
        let manifest = plugin_dir.join(MANIFEST_FILE_NAME);
        if !tokio::fs::try_exists(&manifest).await.unwrap_or(false) {
            return Err(PluginError::Install(format!(
                "Refusing to remove {:?}: not a plugin directory",
                plugin_dir
            )));
        }

        tracing::info!(dir = ?plugin_dir, "Removing plugin directory");
        tokio::fs::remove_dir_all(plugin_dir)
            .await
            .map_err(|e| PluginError::io(plugin_dir, e))
    }

    async fn get_update_info(
        &self,
        plugin_id: &str,
        version: &str,
        repo_url: &str,
    ) -> PluginResult<UpdateInfo> {
        let package_url = Self::repo_package(repo_url, plugin_id, version);
        let dir = Self::package_dir(&package_url)?;
        if !dir.join(MANIFEST_FILE_NAME).is_file() {
            return Err(PluginError::Install(format!(
                "Version {} of plugin '{}' not found in repository {}",
                version, plugin_id, repo_url
            )));
        }
        Ok(UpdateInfo { package_url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_package(dir: &Path, id: &str) {
        fs::create_dir_all(dir.join("img")).unwrap();
        fs::write(
            dir.join(MANIFEST_FILE_NAME),
            format!(r#"{{ "id": "{}", "type": "panel" }}"#, id),
        )
        .unwrap();
        fs::write(dir.join("img/logo.svg"), "<svg/>").unwrap();
    }

    #[tokio::test]
    async fn test_install_from_local_dir() {
        let pkg = tempfile::tempdir().unwrap();
        let plugins = tempfile::tempdir().unwrap();
        write_package(pkg.path(), "test-panel");

        let opts = InstallOpts {
            package_url: Some(pkg.path().to_string_lossy().into_owned()),
            ..Default::default()
        };
        LocalInstaller::new()
            .install("test-panel", "1.0.0", plugins.path(), &opts)
            .await
            .unwrap();

        let installed = plugins.path().join("test-panel");
        assert!(installed.join(MANIFEST_FILE_NAME).is_file());
        assert!(installed.join("img/logo.svg").is_file());
    }

    #[tokio::test]
    async fn test_install_from_repo_and_file_url() {
        let repo = tempfile::tempdir().unwrap();
        let plugins = tempfile::tempdir().unwrap();
        write_package(&repo.path().join("test-panel/2.0.0"), "test-panel");

        let repo_url = url::Url::from_directory_path(repo.path()).unwrap().to_string();
        let opts = InstallOpts {
            package_url: None,
            repo_url: repo_url.clone(),
        };
        LocalInstaller::new()
            .install("test-panel", "2.0.0", plugins.path(), &opts)
            .await
            .unwrap();
        assert!(plugins.path().join("test-panel/plugin.json").is_file());

        let info = LocalInstaller::new()
            .get_update_info("test-panel", "2.0.0", &repo_url)
            .await
            .unwrap();
        assert!(info.package_url.ends_with("test-panel/2.0.0"));
    }

    #[tokio::test]
    async fn test_install_refuses_existing_target() {
        let pkg = tempfile::tempdir().unwrap();
        let plugins = tempfile::tempdir().unwrap();
        write_package(pkg.path(), "test-panel");
        fs::create_dir_all(plugins.path().join("test-panel")).unwrap();

        let opts = InstallOpts {
            package_url: Some(pkg.path().to_string_lossy().into_owned()),
            ..Default::default()
        };
        let err = LocalInstaller::new()
            .install("test-panel", "1.0.0", plugins.path(), &opts)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_remote_sources_are_rejected() {
        let plugins = tempfile::tempdir().unwrap();
        let opts = InstallOpts {
            package_url: Some("https://example.com/plugin.zip".to_string()),
            ..Default::default()
        };
        let err = LocalInstaller::new()
            .install("x", "1.0.0", plugins.path(), &opts)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported package source"));
    }

    #[tokio::test]
    async fn test_uninstall_removes_plugin_dir_only() {
        let plugins = tempfile::tempdir().unwrap();
        let dir = plugins.path().join("test-panel");
        write_package(&dir, "test-panel");

        LocalInstaller::new().uninstall(&dir).await.unwrap();
        assert!(!dir.exists());

        let not_plugin = plugins.path().join("random");
        fs::create_dir_all(&not_plugin).unwrap();
        assert!(LocalInstaller::new().uninstall(&not_plugin).await.is_err());
        assert!(not_plugin.exists());
    }
}
