//! Plugin CLI commands
//!
//! `run` supervises plugin backends until Ctrl-C. The one-shot commands load
//! plugins without backend clients, so no plugin process is ever spawned
//! just to list or install something.

use crate::config::Config;
use crate::plugins::manifest::MANIFEST_FILE_NAME;
use crate::plugins::{
    BackendPlugin, InstallOpts, LocalInstaller, Loader, ManifestDigestValidator, Plugin,
    PluginError, PluginInitializer, PluginManager, PluginResult, PluginValidator,
    SignaturePolicy, SignatureValidator,
};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Initializer for one-shot commands: plugins get no backend client
struct FrontendOnly;

impl PluginInitializer for FrontendOnly {
    fn initialize(&self, _plugin: &Plugin) -> PluginResult<Option<Arc<dyn BackendPlugin>>> {
        Ok(None)
    }
}

/// Manager whose plugins never start a backend
async fn offline_manager(config: &Config) -> Result<PluginManager> {
    let mgr_config = config.manager_config();
    let loader = Loader::new(mgr_config.roots())
        .with_signature_policy(SignaturePolicy::new(mgr_config.allow_unsigned.iter().cloned()))
        .with_initializer(Arc::new(FrontendOnly));
    let manager = PluginManager::new(
        mgr_config,
        Arc::new(loader),
        Arc::new(LocalInstaller::new()),
    );
    manager.init().await.context("Failed to load plugins")?;
    Ok(manager)
}

async fn report_errors(manager: &PluginManager) {
    for entry in manager.plugin_errors().await {
        match &entry.plugin_id {
            Some(id) => eprintln!("  ! {} ({}): {}", id, entry.dir.display(), entry.error),
            None => eprintln!("  ! {}: {}", entry.dir.display(), entry.error),
        }
    }
}

/// Load every plugin and supervise backends until Ctrl-C
pub async fn run(config: &Config) -> Result<()> {
    let manager = PluginManager::from_config(config.manager_config());
    let registered = manager.init().await.context("Failed to load plugins")?;
    tracing::info!(count = registered.len(), "Plugins registered");

    for entry in manager.plugin_errors().await {
        tracing::warn!(dir = ?entry.dir, error = %entry.error, "Plugin not loaded cleanly");
    }

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
        tracing::info!("Shutdown requested");
        ctrl_c.cancel();
    });

    match manager.run(token).await {
        Ok(()) | Err(PluginError::Cancelled) => Ok(()),
        Err(e) => Err(e).context("Plugin supervisor failed"),
    }
}

/// List all loaded plugins
pub async fn list(config: &Config) -> Result<()> {
    let manager = offline_manager(config).await?;
    let plugins = manager.plugins().await;

    if plugins.is_empty() {
        println!("No plugins found.");
        println!("\nPlugins directory: {}", config.paths.plugins.display());
    } else {
        println!("Loaded plugins ({}):\n", plugins.len());
        for plugin in &plugins {
            println!("  {} (v{}) [{}]", plugin.id(), plugin.version(), plugin.plugin_type());
            if !plugin.name().is_empty() && plugin.name() != plugin.id() {
                println!("    Name: {}", plugin.name());
            }
            println!("    Class: {}", plugin.class());
            println!("    Signature: {}", plugin.signature_status());
            println!("    Directory: {}", plugin.dir().display());
            if let Some(parent) = plugin.parent() {
                println!("    Parent: {}", parent);
            }
            if plugin.manifest().backend {
                println!("    Backend: yes");
            }
            println!();
        }
    }

    let errors = manager.plugin_errors().await;
    if !errors.is_empty() {
        eprintln!("Plugin errors ({}):", errors.len());
        report_errors(&manager).await;
    }

    Ok(())
}

/// Validate the plugin in `dir`
pub fn validate(dir: &Path) -> Result<()> {
    let manifest_path = dir.join(MANIFEST_FILE_NAME);
    if !manifest_path.is_file() {
        anyhow::bail!("No {} found in {}", MANIFEST_FILE_NAME, dir.display());
    }

    let manifest = Loader::read_manifest(&manifest_path).context("Plugin validation failed")?;
    PluginValidator::validate(&manifest).context("Plugin validation failed")?;

    let signature = ManifestDigestValidator::new()
        .validate(dir, &manifest)
        .context("Signature check failed")?;

    println!("✓ Plugin manifest is valid!");
    println!("\nPlugin details:");
    println!("  ID: {}", manifest.id);
    println!("  Type: {}", manifest.plugin_type);
    println!("  Name: {}", manifest.name);
    println!("  Version: {}", manifest.info.version);
    if !manifest.info.description.is_empty() {
        println!("  Description: {}", manifest.info.description);
    }
    if manifest.backend {
        println!(
            "  Executable: {}",
            manifest.executable.as_deref().unwrap_or("<none>")
        );
    }
    if !manifest.includes.is_empty() {
        println!("  Includes: {}", manifest.includes.len());
    }
    println!("  Signature: {}", signature.status);
    if let Some(org) = &signature.org {
        println!("  Signed by: {}", org);
    }

    Ok(())
}

/// Install a plugin package into the plugins directory
pub async fn install(
    config: &Config,
    plugin_id: &str,
    version: &str,
    package: Option<String>,
) -> Result<()> {
    let manager = offline_manager(config).await?;
    let opts = InstallOpts {
        package_url: package,
        repo_url: config.installer.repo_url.clone(),
    };

    let plugin = manager
        .install(plugin_id, version, opts)
        .await
        .with_context(|| format!("Failed to install plugin '{}'", plugin_id))?;

    println!("✓ Plugin installed: {} (v{})", plugin.id(), plugin.version());
    println!("  Location: {}", plugin.dir().display());
    if let Some(err) = plugin.signature_error() {
        println!("  Warning: {}", err);
    }
    Ok(())
}

/// Uninstall an external plugin
pub async fn uninstall(config: &Config, plugin_id: &str) -> Result<()> {
    let manager = offline_manager(config).await?;
    manager
        .uninstall(plugin_id)
        .await
        .with_context(|| format!("Failed to uninstall plugin '{}'", plugin_id))?;

    println!("✓ Plugin uninstalled: {}", plugin_id);
    Ok(())
}

/// Replace an installed plugin with another version
pub async fn update(config: &Config, plugin_id: &str, version: &str) -> Result<()> {
    let manager = offline_manager(config).await?;
    let plugin = manager
        .update(plugin_id, version)
        .await
        .with_context(|| format!("Failed to update plugin '{}'", plugin_id))?;

    println!("✓ Plugin updated: {} (v{})", plugin.id(), plugin.version());
    Ok(())
}
