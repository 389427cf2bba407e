//! Plugin manager
//!
//! Owns one [`PluginRegistry`] and everything that happens to a plugin after
//! it is loaded: registration, starting and stopping its backend, restarting
//! crashed backends while the supervisor runs, routing dispatch calls, and
//! installing or removing plugin packages.
//!
//! Every state change of a plugin happens under its lifecycle lock, and the
//! registry lock is only taken while that lock is held, never the other way
//! around. A restart therefore always sees the outcome of a concurrent stop
//! or uninstall.

use super::backend::{
    BackendError, BackendPlugin, BackendResult, CallResourceRequest, CallResourceResponseSender,
    Capabilities, CheckHealthRequest, CheckHealthResult, CollectMetricsResult, PluginContext,
    QueryDataRequest, QueryDataResponse,
};
use super::finder::resolve_path;
use super::installer::{InstallOpts, Installer, LocalInstaller};
use super::loader::{Loader, PluginRoots, PluginSource};
use super::manifest::PluginType;
use super::plugin::{Plugin, PluginState};
use super::registry::PluginRegistry;
use super::signature::SignaturePolicy;
use super::{PluginError, PluginResult};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

/// Default delay between restart attempts of a crashed backend
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound of a single dispatch call
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Manager settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory external plugins are installed into
    pub plugins_path: PathBuf,
    pub bundled_plugins_path: Option<PathBuf>,
    /// Host static root; core plugins live in `<static_root>/app/plugins`
    pub static_root: Option<PathBuf>,
    pub restart_delay: Duration,
    pub dispatch_timeout: Duration,
    /// Repository used when an install names no package
    pub repo_url: String,
    /// Plugin IDs allowed to run without a signature
    pub allow_unsigned: Vec<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            plugins_path: PathBuf::from("data/plugins"),
            bundled_plugins_path: None,
            static_root: None,
            restart_delay: DEFAULT_RESTART_DELAY,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            repo_url: String::new(),
            allow_unsigned: Vec::new(),
        }
    }
}

impl ManagerConfig {
    pub fn roots(&self) -> PluginRoots {
        PluginRoots {
            static_root: self.static_root.clone(),
            bundled: self.bundled_plugins_path.clone(),
            plugins: Some(self.plugins_path.clone()),
        }
    }
}

/// Directory a non-core plugin's static assets are served from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoute {
    pub plugin_id: String,
    pub directory: PathBuf,
}

/// A load or signature problem reported by [`PluginManager::plugin_errors`]
#[derive(Debug, Clone)]
pub struct PluginErrorEntry {
    /// Set for registered plugins; load failures may not have an ID yet
    pub plugin_id: Option<String>,
    pub dir: PathBuf,
    pub error: PluginError,
}

/// Plugin manager and backend supervisor
pub struct PluginManager {
    config: ManagerConfig,
    registry: Arc<PluginRegistry>,
    source: Arc<dyn PluginSource>,
    installer: Arc<dyn Installer>,
    tracker: TaskTracker,
    /// Token of the running supervisor, if any
    supervisor: std::sync::Mutex<Option<CancellationToken>>,
    load_errors: std::sync::Mutex<BTreeMap<PathBuf, PluginError>>,
}

impl PluginManager {
    pub fn new(
        config: ManagerConfig,
        source: Arc<dyn PluginSource>,
        installer: Arc<dyn Installer>,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(PluginRegistry::new()),
            source,
            installer,
            tracker: TaskTracker::new(),
            supervisor: std::sync::Mutex::new(None),
            load_errors: std::sync::Mutex::new(BTreeMap::new()),
        }
    }

    /// Manager with the default loader and the local installer
    pub fn from_config(config: ManagerConfig) -> Self {
        let loader = Loader::new(config.roots()).with_signature_policy(SignaturePolicy::new(
            config.allow_unsigned.iter().cloned(),
        ));
        Self::new(config, Arc::new(loader), Arc::new(LocalInstaller::new()))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Create the plugins directory and load every plugin root
    pub async fn init(&self) -> PluginResult<Vec<Arc<Plugin>>> {
        let plugins_path = &self.config.plugins_path;
        if !tokio::fs::try_exists(plugins_path).await.unwrap_or(false) {
            tracing::info!(dir = ?plugins_path, "Creating plugins directory");
            tokio::fs::create_dir_all(plugins_path)
                .await
                .map_err(|e| PluginError::io(plugins_path, e))?;
        }

        let roots = self.config.roots();
        let paths: Vec<PathBuf> = [roots.core_dir(), roots.bundled, roots.plugins]
            .into_iter()
            .flatten()
            .filter(|p| !p.as_os_str().is_empty())
            .collect();

        self.load_plugins(&paths).await
    }

    /// Load plugins under `paths` and register them
    ///
    /// Already registered IDs are skipped. Per-plugin failures are kept for
    /// [`plugin_errors`](Self::plugin_errors); the returned list holds the
    /// newly registered plugins.
    pub async fn load_plugins(&self, paths: &[PathBuf]) -> PluginResult<Vec<Arc<Plugin>>> {
        let known: HashSet<String> = self.registry.ids().await.into_iter().collect();
        let batch = self.source.load(paths, &known)?;

        self.with_load_errors(|errors| errors.extend(batch.errors));

        let mut registered = Vec::with_capacity(batch.plugins.len());
        for plugin in batch.plugins {
            let plugin = Arc::new(plugin);
            let dir = plugin.dir().to_path_buf();
            match self.register_and_start(plugin.clone()).await {
                Ok(()) => {
                    self.with_load_errors(|errors| {
                        errors.remove(&dir);
                    });
                    registered.push(plugin);
                }
                Err(e) => {
                    tracing::error!(plugin_id = %plugin.id(), error = %e, "Failed to register plugin");
                    self.with_load_errors(|errors| {
                        errors.insert(dir, e);
                    });
                }
            }
        }

        Ok(registered)
    }

    /// Register a plugin and start its backend if the host manages it
    ///
    /// A plugin carrying a signature error is registered but not started.
    /// A start failure is returned and recorded as the plugin's last error;
    /// the plugin stays `Registered` and is not watched, so it is retried
    /// only by an explicit [`start`](Self::start). The supervisor restarts
    /// only backends that were running and then exited.
    pub async fn register_and_start(&self, plugin: Arc<Plugin>) -> PluginResult<()> {
        self.registry.insert(plugin.clone()).await?;

        let span = plugin.span().clone();
        async {
            tracing::debug!(class = %plugin.class(), "Plugin registered");

            if let Some(err) = plugin.signature_error() {
                tracing::warn!(error = %err, "Not starting plugin with signature error");
                return Ok(());
            }

            self.start_plugin(&plugin).await
        }
        .instrument(span)
        .await
    }

    /// Decommission, stop and unregister a plugin
    pub async fn unregister_and_stop(&self, plugin_id: &str) -> PluginResult<()> {
        let plugin = self
            .registry
            .get(plugin_id)
            .await
            .ok_or_else(|| PluginError::NotRegistered(plugin_id.to_string()))?;

        let span = plugin.span().clone();
        async {
            let mut lifecycle = plugin.lifecycle().lock().await;
            lifecycle.state = PluginState::Decommissioned;

            if let Some(client) = plugin.client() {
                client.decommission();
                if let Err(e) = client.stop().await {
                    tracing::warn!(error = %e, "Failed to stop plugin backend");
                }
            }

            self.registry.remove(plugin_id).await?;
            tracing::info!("Plugin unregistered");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Start a registered plugin's backend
    pub async fn start(&self, plugin_id: &str) -> PluginResult<()> {
        let plugin = self
            .registry
            .get(plugin_id)
            .await
            .ok_or_else(|| PluginError::NotRegistered(plugin_id.to_string()))?;
        let span = plugin.span().clone();
        self.start_plugin(&plugin).instrument(span).await
    }

    /// Stop a registered plugin's backend; the supervisor will not restart it
    pub async fn stop(&self, plugin_id: &str) -> PluginResult<()> {
        let plugin = self
            .registry
            .get(plugin_id)
            .await
            .ok_or_else(|| PluginError::NotRegistered(plugin_id.to_string()))?;
        let span = plugin.span().clone();
        Self::stop_plugin(&plugin).instrument(span).await
    }

    async fn start_plugin(&self, plugin: &Arc<Plugin>) -> PluginResult<()> {
        let Some(client) = plugin.client().filter(|c| c.is_managed()) else {
            return Ok(());
        };

        let mut lifecycle = plugin.lifecycle().lock().await;

        if !self.registry.contains(plugin.id()).await {
            return Err(PluginError::NotRegistered(plugin.id().to_string()));
        }
        if lifecycle.state == PluginState::Decommissioned || client.is_decommissioned() {
            return Err(BackendError::Unavailable(plugin.id().to_string()).into());
        }

        if lifecycle.state == PluginState::Running && !client.exited() {
            tracing::debug!("Plugin already running");
        } else {
            tracing::info!("Starting plugin backend");
            if let Err(e) = client.start().await {
                lifecycle.last_error = Some(e.to_string());
                return Err(e.into());
            }
            lifecycle.state = PluginState::Running;
            lifecycle.last_error = None;
        }

        if let Some(token) = self.supervisor_token() {
            if !lifecycle.watching {
                lifecycle.watching = true;
                self.spawn_watcher(plugin.clone(), token);
            }
        }

        Ok(())
    }

    async fn stop_plugin(plugin: &Plugin) -> PluginResult<()> {
        let Some(client) = plugin.client() else {
            return Ok(());
        };

        let mut lifecycle = plugin.lifecycle().lock().await;
        if lifecycle.state == PluginState::Decommissioned {
            return Ok(());
        }

        tracing::info!("Stopping plugin backend");
        client.stop().await?;
        lifecycle.state = PluginState::Stopped;
        Ok(())
    }

    /// Supervise managed backends until `token` is cancelled
    ///
    /// Crashed backends of running plugins are restarted. On cancellation
    /// every managed plugin is stopped and the watchers are awaited; the
    /// call then returns [`PluginError::Cancelled`].
    pub async fn run(&self, token: CancellationToken) -> PluginResult<()> {
        *self.lock_supervisor() = Some(token.clone());
        tracing::info!("Plugin supervisor started");

        for plugin in self.registry.plugins().await {
            if !plugin.is_managed() {
                continue;
            }
            let mut lifecycle = plugin.lifecycle().lock().await;
            if lifecycle.state == PluginState::Running && !lifecycle.watching {
                lifecycle.watching = true;
                self.spawn_watcher(plugin.clone(), token.clone());
            }
        }

        token.cancelled().await;
        *self.lock_supervisor() = None;
        tracing::info!("Plugin supervisor shutting down");

        self.stop_all().await;

        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();

        Err(PluginError::Cancelled)
    }

    async fn stop_all(&self) {
        let plugins = self.registry.plugins().await;
        let stops = plugins.iter().filter(|p| p.is_managed()).map(|plugin| {
            let span = plugin.span().clone();
            async move {
                let Some(client) = plugin.client() else {
                    return;
                };
                let mut lifecycle = plugin.lifecycle().lock().await;
                if lifecycle.state == PluginState::Decommissioned {
                    return;
                }
                if let Err(e) = client.stop().await {
                    tracing::warn!(error = %e, "Failed to stop plugin backend");
                }
                if lifecycle.state == PluginState::Running {
                    lifecycle.state = PluginState::Stopped;
                }
            }
            .instrument(span)
        });

        futures::future::join_all(stops).await;
    }

    fn spawn_watcher(&self, plugin: Arc<Plugin>, token: CancellationToken) {
        let span = plugin.span().clone();
        self.tracker.spawn(
            watch_plugin(
                plugin,
                self.registry.clone(),
                token,
                self.config.restart_delay,
            )
            .instrument(span),
        );
    }

    fn supervisor_token(&self) -> Option<CancellationToken> {
        self.lock_supervisor()
            .as_ref()
            .filter(|t| !t.is_cancelled())
            .cloned()
    }

    fn lock_supervisor(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.supervisor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_load_errors<R>(&self, f: impl FnOnce(&mut BTreeMap<PathBuf, PluginError>) -> R) -> R {
        let mut errors = self.load_errors.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut errors)
    }

    // Dispatch

    pub async fn collect_metrics(&self, ctx: &PluginContext) -> PluginResult<CollectMetricsResult> {
        let (plugin, client) = self
            .dispatch_target(&ctx.plugin_id, |c| c.collect_metrics)
            .await?;
        self.bounded(client.collect_metrics(ctx))
            .instrument(plugin.span().clone())
            .await
    }

    pub async fn check_health(&self, req: &CheckHealthRequest) -> PluginResult<CheckHealthResult> {
        let (plugin, client) = self
            .dispatch_target(&req.plugin_context.plugin_id, |c| c.check_health)
            .await?;
        self.bounded(client.check_health(req))
            .instrument(plugin.span().clone())
            .await
    }

    pub async fn query_data(&self, req: &QueryDataRequest) -> PluginResult<QueryDataResponse> {
        let (plugin, client) = self
            .dispatch_target(&req.plugin_context.plugin_id, |c| c.query_data)
            .await?;
        self.bounded(client.query_data(req))
            .instrument(plugin.span().clone())
            .await
    }

    /// Forward a resource call; response chunks are streamed into `sender`
    pub async fn call_resource(
        &self,
        req: &CallResourceRequest,
        sender: &mut dyn CallResourceResponseSender,
    ) -> PluginResult<()> {
        let (plugin, client) = self
            .dispatch_target(&req.plugin_context.plugin_id, |c| c.call_resource)
            .await?;
        self.bounded(client.call_resource(req, sender))
            .instrument(plugin.span().clone())
            .await
    }

    async fn dispatch_target(
        &self,
        plugin_id: &str,
        supported: impl Fn(Capabilities) -> bool,
    ) -> PluginResult<(Arc<Plugin>, Arc<dyn BackendPlugin>)> {
        let plugin = self
            .registry
            .get(plugin_id)
            .await
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;

        let client = match plugin.client() {
            Some(client) if supported(client.capabilities()) => client.clone(),
            _ => return Err(BackendError::MethodNotImplemented.into()),
        };

        if client.is_decommissioned() {
            return Err(BackendError::Unavailable(plugin_id.to_string()).into());
        }

        Ok((plugin, client))
    }

    async fn bounded<T>(&self, call: impl Future<Output = BackendResult<T>>) -> PluginResult<T> {
        let limit = self.config.dispatch_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(PluginError::from),
            Err(_) => {
                tracing::warn!(timeout = ?limit, "Plugin call timed out");
                Err(BackendError::Timeout(limit).into())
            }
        }
    }

    // Installation

    /// Install a plugin package and register it
    pub async fn install(
        &self,
        plugin_id: &str,
        version: &str,
        mut opts: InstallOpts,
    ) -> PluginResult<Arc<Plugin>> {
        if let Some(existing) = self.registry.get(plugin_id).await {
            return Err(PluginError::Duplicate {
                plugin_id: plugin_id.to_string(),
                existing_dir: existing.dir().to_path_buf(),
            });
        }

        if opts.repo_url.is_empty() {
            opts.repo_url = self.config.repo_url.clone();
        }

        self.installer
            .install(plugin_id, version, &self.config.plugins_path, &opts)
            .await?;

        let dir = self.config.plugins_path.join(plugin_id);
        self.load_plugins(std::slice::from_ref(&dir)).await?;

        if let Some(plugin) = self.registry.get(plugin_id).await {
            tracing::info!(plugin_id, version, "Plugin installed");
            return Ok(plugin);
        }

        let resolved = resolve_path(&dir);
        let error = self.with_load_errors(|errors| errors.get(&resolved).cloned());
        Err(error.unwrap_or_else(|| {
            PluginError::Install(format!(
                "Package for '{}' did not contain a plugin with that ID",
                plugin_id
            ))
        }))
    }

    /// Unregister an external plugin and remove its directory
    pub async fn uninstall(&self, plugin_id: &str) -> PluginResult<()> {
        let plugin = self
            .registry
            .get(plugin_id)
            .await
            .ok_or_else(|| PluginError::NotInstalled(plugin_id.to_string()))?;

        if !plugin.is_external() {
            return Err(PluginError::UninstallCorePlugin(plugin_id.to_string()));
        }

        let dir = resolve_path(plugin.dir());
        if !self.is_inside_plugins_dir(&dir) {
            return Err(PluginError::UninstallOutsideOfPluginDir {
                plugin_id: plugin_id.to_string(),
                dir,
            });
        }

        self.unregister_and_stop(plugin_id).await?;
        self.installer.uninstall(&dir).await?;
        tracing::info!(plugin_id, "Plugin uninstalled");
        Ok(())
    }

    /// Replace an installed external plugin with another version
    pub async fn update(&self, plugin_id: &str, version: &str) -> PluginResult<Arc<Plugin>> {
        let plugin = self
            .registry
            .get(plugin_id)
            .await
            .ok_or_else(|| PluginError::NotInstalled(plugin_id.to_string()))?;

        if !plugin.is_external() {
            return Err(PluginError::UninstallCorePlugin(plugin_id.to_string()));
        }
        if plugin.version() == version {
            return Err(PluginError::Duplicate {
                plugin_id: plugin_id.to_string(),
                existing_dir: plugin.dir().to_path_buf(),
            });
        }

        let repo_url = self.config.repo_url.clone();
        let info = self
            .installer
            .get_update_info(plugin_id, version, &repo_url)
            .await?;

        tracing::info!(plugin_id, from = %plugin.version(), to = version, "Updating plugin");
        self.uninstall(plugin_id).await?;
        self.install(
            plugin_id,
            version,
            InstallOpts {
                package_url: Some(info.package_url),
                repo_url,
            },
        )
        .await
    }

    fn is_inside_plugins_dir(&self, dir: &Path) -> bool {
        let root = resolve_path(&self.config.plugins_path);
        dir != root && dir.starts_with(&root)
    }

    // Queries

    pub async fn plugin(&self, plugin_id: &str) -> Option<Arc<Plugin>> {
        self.registry.get(plugin_id).await
    }

    /// All registered plugins, sorted by ID
    pub async fn plugins(&self) -> Vec<Arc<Plugin>> {
        self.registry.plugins().await
    }

    pub async fn plugins_of_type(&self, plugin_type: PluginType) -> Vec<Arc<Plugin>> {
        self.registry
            .plugins()
            .await
            .into_iter()
            .filter(|p| p.plugin_type() == plugin_type)
            .collect()
    }

    pub async fn is_registered(&self, plugin_id: &str) -> bool {
        self.registry.contains(plugin_id).await
    }

    pub async fn plugin_state(&self, plugin_id: &str) -> Option<PluginState> {
        match self.registry.get(plugin_id).await {
            Some(plugin) => Some(plugin.state().await),
            None => None,
        }
    }

    pub async fn static_routes(&self) -> Vec<StaticRoute> {
        self.registry
            .plugins()
            .await
            .into_iter()
            .filter(|p| !p.is_core())
            .map(|p| StaticRoute {
                plugin_id: p.id().to_string(),
                directory: p.dir().to_path_buf(),
            })
            .collect()
    }

    /// Load failures plus signature errors of registered plugins
    pub async fn plugin_errors(&self) -> Vec<PluginErrorEntry> {
        let mut entries: Vec<PluginErrorEntry> = self.with_load_errors(|errors| {
            errors
                .iter()
                .map(|(dir, error)| PluginErrorEntry {
                    plugin_id: None,
                    dir: dir.clone(),
                    error: error.clone(),
                })
                .collect()
        });

        for plugin in self.registry.plugins().await {
            if let Some(err) = plugin.signature_error() {
                entries.push(PluginErrorEntry {
                    plugin_id: Some(plugin.id().to_string()),
                    dir: plugin.dir().to_path_buf(),
                    error: err.clone().into(),
                });
            }
        }

        entries
    }
}

/// Watch one managed plugin and restart its backend when it exits unasked
///
/// The watcher ends when the supervisor is cancelled or the plugin is no
/// longer meant to run: stopped, decommissioned or unregistered.
async fn watch_plugin(
    plugin: Arc<Plugin>,
    registry: Arc<PluginRegistry>,
    token: CancellationToken,
    restart_delay: Duration,
) {
    let Some(client) = plugin.client().cloned() else {
        plugin.lifecycle().lock().await.watching = false;
        return;
    };
    let mut exit = client.exit_signal();
    tracing::debug!("Watching plugin backend");

    loop {
        let exited = tokio::select! {
            _ = token.cancelled() => false,
            exited = exit.wait() => exited,
        };

        let mut lifecycle = plugin.lifecycle().lock().await;
        if !exited
            || token.is_cancelled()
            || client.is_decommissioned()
            || lifecycle.state != PluginState::Running
            || !registry.contains(plugin.id()).await
        {
            lifecycle.watching = false;
            break;
        }
        if !client.exited() {
            continue;
        }

        drop(lifecycle);

        tracing::warn!("Plugin backend exited unexpectedly, restarting");
        // Unlocked so a hung start never blocks stop, unregister or shutdown
        let restarted = tokio::select! {
            _ = token.cancelled() => {
                plugin.lifecycle().lock().await.watching = false;
                break;
            }
            result = client.start() => result,
        };

        let mut lifecycle = plugin.lifecycle().lock().await;
        match restarted {
            Ok(()) => {
                if token.is_cancelled()
                    || client.is_decommissioned()
                    || lifecycle.state != PluginState::Running
                    || !registry.contains(plugin.id()).await
                {
                    tracing::info!("Plugin was stopped during restart, stopping backend again");
                    if let Err(e) = client.stop().await {
                        tracing::warn!(error = %e, "Failed to stop plugin backend");
                    }
                    lifecycle.watching = false;
                    break;
                }
                lifecycle.last_error = None;
                tracing::info!("Plugin backend restarted");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to restart plugin backend");
                lifecycle.last_error = Some(e.to_string());
                drop(lifecycle);

                tokio::select! {
                    _ = token.cancelled() => {
                        plugin.lifecycle().lock().await.watching = false;
                        break;
                    }
                    _ = tokio::time::sleep(restart_delay) => {}
                }
            }
        }
    }

    tracing::debug!("Stopped watching plugin backend");
}
