//! Plugin descriptor
//!
//! A [`Plugin`] is what the loader produces for every accepted manifest and
//! what the registry hands out. Everything but the lifecycle cell is fixed
//! once the descriptor is registered.

use super::backend::BackendPlugin;
use super::manifest::{DEFAULT_INCLUDE_ROLE, PluginManifest, PluginType, slugify};
use super::signature::{SignatureError, SignatureInfo, SignatureStatus};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Where a plugin was installed from, in order of trust
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginClass {
    /// Ships inside the host's static root
    Core,
    /// Ships with the host distribution
    Bundled,
    /// Installed into the plugins directory
    External,
    Unknown,
}

impl PluginClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginClass::Core => "core",
            PluginClass::Bundled => "bundled",
            PluginClass::External => "external",
            PluginClass::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for PluginClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a registered plugin
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    #[default]
    Registered,
    Running,
    Stopped,
    /// Terminal; the plugin is being or has been removed
    Decommissioned,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PluginState::Registered => "registered",
            PluginState::Running => "running",
            PluginState::Stopped => "stopped",
            PluginState::Decommissioned => "decommissioned",
        };
        f.write_str(s)
    }
}

/// Mutable runtime part of a descriptor, guarded by the plugin's lifecycle lock
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    pub state: PluginState,
    pub last_error: Option<String>,
    /// A supervisor watcher task currently owns this plugin
    pub watching: bool,
}

/// Loaded plugin
pub struct Plugin {
    manifest: PluginManifest,
    plugin_type: PluginType,
    dir: PathBuf,
    class: PluginClass,
    module: String,
    base_url: String,
    signature: SignatureInfo,
    signature_error: Option<SignatureError>,
    parent: Option<String>,
    children: Vec<String>,
    client: Option<Arc<dyn BackendPlugin>>,
    span: tracing::Span,
    lifecycle: Mutex<Lifecycle>,
}

impl Plugin {
    /// Build a descriptor from a validated manifest
    ///
    /// Frontend paths, logos, screenshots, includes and the host dependency
    /// are normalised here, the same way for every loader.
    pub fn new(
        mut manifest: PluginManifest,
        plugin_type: PluginType,
        dir: PathBuf,
        class: PluginClass,
    ) -> Self {
        let (module, base_url) = frontend_paths(&manifest.id, plugin_type, &dir, class);
        normalize_manifest(&mut manifest, plugin_type, class, &base_url);

        let span = tracing::info_span!(
            "plugin",
            plugin_id = %manifest.id,
            plugin_type = %plugin_type
        );

        let signature = if class == PluginClass::Core {
            SignatureInfo::internal()
        } else {
            SignatureInfo::unsigned()
        };

        Self {
            manifest,
            plugin_type,
            dir,
            class,
            module,
            base_url,
            signature,
            signature_error: None,
            parent: None,
            children: Vec::new(),
            client: None,
            span,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Attach a backend client
    pub fn with_client(mut self, client: Arc<dyn BackendPlugin>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_signature(mut self, signature: SignatureInfo) -> Self {
        self.signature = signature;
        self
    }

    pub(crate) fn set_signature(&mut self, signature: SignatureInfo) {
        self.signature = signature;
    }

    pub(crate) fn set_signature_error(&mut self, error: Option<SignatureError>) {
        self.signature_error = error;
    }

    pub(crate) fn set_client(&mut self, client: Option<Arc<dyn BackendPlugin>>) {
        self.client = client;
    }

    pub(crate) fn set_parent(&mut self, parent: String) {
        self.parent = Some(parent);
    }

    pub(crate) fn add_child(&mut self, child: String) {
        self.children.push(child);
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn version(&self) -> &str {
        &self.manifest.info.version
    }

    pub fn plugin_type(&self) -> PluginType {
        self.plugin_type
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn class(&self) -> PluginClass {
        self.class
    }

    pub fn is_core(&self) -> bool {
        self.class == PluginClass::Core
    }

    pub fn is_external(&self) -> bool {
        self.class == PluginClass::External
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn signature(&self) -> &SignatureInfo {
        &self.signature
    }

    pub fn signature_status(&self) -> SignatureStatus {
        self.signature.status
    }

    /// Signature problem found at load time; the host decides whether to admit the plugin
    pub fn signature_error(&self) -> Option<&SignatureError> {
        self.signature_error.as_ref()
    }

    /// ID of the enclosing plugin, if this one ships inside another
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn children(&self) -> &[String] {
        &self.children
    }

    pub fn client(&self) -> Option<&Arc<dyn BackendPlugin>> {
        self.client.as_ref()
    }

    /// Whether the host supervises this plugin's backend process
    pub fn is_managed(&self) -> bool {
        self.client.as_ref().is_some_and(|c| c.is_managed())
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub async fn state(&self) -> PluginState {
        self.lifecycle.lock().await.state
    }

    /// Most recent start/restart failure
    pub async fn last_error(&self) -> Option<String> {
        self.lifecycle.lock().await.last_error.clone()
    }

    pub(crate) fn lifecycle(&self) -> &Mutex<Lifecycle> {
        &self.lifecycle
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.manifest.id)
            .field("type", &self.plugin_type)
            .field("dir", &self.dir)
            .field("class", &self.class)
            .field("signature", &self.signature.status)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("has_client", &self.client.is_some())
            .finish()
    }
}

/// Decide a plugin's class from its (resolved) directory
///
/// Roots are checked core, bundled, external; a directory equal to a root
/// counts as inside it. Unset roots never match.
pub fn classify(
    dir: &Path,
    core_root: Option<&Path>,
    bundled_root: Option<&Path>,
    plugins_root: Option<&Path>,
) -> PluginClass {
    let inside = |root: Option<&Path>| root.is_some_and(|r| !r.as_os_str().is_empty() && dir.starts_with(r));

    if inside(core_root) {
        PluginClass::Core
    } else if inside(bundled_root) {
        PluginClass::Bundled
    } else if inside(plugins_root) {
        PluginClass::External
    } else {
        PluginClass::Unknown
    }
}

fn frontend_paths(
    id: &str,
    plugin_type: PluginType,
    dir: &Path,
    class: PluginClass,
) -> (String, String) {
    match class {
        PluginClass::Core | PluginClass::Bundled => {
            let dir_name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| id.to_string());
            (
                format!("app/plugins/{}/{}/module", plugin_type, dir_name),
                format!("public/app/plugins/{}/{}", plugin_type, dir_name),
            )
        }
        PluginClass::External | PluginClass::Unknown => (
            format!("plugins/{}/module", id),
            format!("public/plugins/{}", id),
        ),
    }
}

fn normalize_manifest(
    manifest: &mut PluginManifest,
    plugin_type: PluginType,
    class: PluginClass,
    base_url: &str,
) {
    let logos = &mut manifest.info.logos;
    logos.small = logo_url(plugin_type, &logos.small, base_url);
    logos.large = logo_url(plugin_type, &logos.large, base_url);

    for shot in &mut manifest.info.screenshots {
        shot.path = relative_url(&shot.path, base_url);
    }

    for include in &mut manifest.includes {
        if include.role.is_empty() {
            include.role = DEFAULT_INCLUDE_ROLE.to_string();
        }
        if include.slug.is_empty() && class != PluginClass::Core {
            include.slug = slugify(&include.name);
        }
    }

    if manifest.dependencies.host_version.is_empty() {
        manifest.dependencies.host_version = "*".to_string();
    }
}

fn logo_url(plugin_type: PluginType, path: &str, base_url: &str) -> String {
    if path.is_empty() {
        format!("public/img/icn-{}.svg", plugin_type)
    } else {
        relative_url(path, base_url)
    }
}

/// Join a manifest-relative asset path onto the plugin's base URL
fn relative_url(path: &str, base_url: &str) -> String {
    if path.is_empty() || url::Url::parse(path).is_ok() || path.starts_with("public/") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches("./").trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::manifest::{PluginInclude, Screenshot};

    fn manifest(id: &str, plugin_type: &str) -> PluginManifest {
        PluginManifest {
            id: id.to_string(),
            plugin_type: plugin_type.to_string(),
            name: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_precedence() {
        let core = Path::new("/srv/public/app/plugins");
        let bundled = Path::new("/srv/plugins-bundled");
        let external = Path::new("/var/lib/plugins");

        let class = |dir: &str| classify(Path::new(dir), Some(core), Some(bundled), Some(external));

        assert_eq!(class("/srv/public/app/plugins/datasource/cloudwatch"), PluginClass::Core);
        assert_eq!(class("/srv/plugins-bundled/test"), PluginClass::Bundled);
        assert_eq!(class("/var/lib/plugins/test-app"), PluginClass::External);
        assert_eq!(class("/var/lib/plugins"), PluginClass::External);
        assert_eq!(class("/tmp/elsewhere"), PluginClass::Unknown);
    }

    #[test]
    fn test_classify_prefers_core_over_nested_roots() {
        // Plugins root nested inside the core root still classifies as core
        let core = Path::new("/srv");
        let external = Path::new("/srv/plugins");
        assert_eq!(
            classify(Path::new("/srv/plugins/x"), Some(core), None, Some(external)),
            PluginClass::Core
        );
    }

    #[test]
    fn test_classify_ignores_empty_roots() {
        assert_eq!(
            classify(Path::new("/anything"), Some(Path::new("")), None, None),
            PluginClass::Unknown
        );
    }

    #[test]
    fn test_classify_is_component_wise() {
        let external = Path::new("/var/lib/plugins");
        assert_eq!(
            classify(Path::new("/var/lib/plugins-other/x"), None, None, Some(external)),
            PluginClass::Unknown
        );
    }

    #[test]
    fn test_core_frontend_paths_use_dir_name() {
        let plugin = Plugin::new(
            manifest("cloudwatch", "datasource"),
            PluginType::DataSource,
            PathBuf::from("/srv/public/app/plugins/datasource/cloudwatch"),
            PluginClass::Core,
        );
        assert_eq!(plugin.module(), "app/plugins/datasource/cloudwatch/module");
        assert_eq!(plugin.base_url(), "public/app/plugins/datasource/cloudwatch");
        assert_eq!(plugin.signature_status(), SignatureStatus::Internal);
    }

    #[test]
    fn test_external_frontend_paths_use_id() {
        let plugin = Plugin::new(
            manifest("test-app", "app"),
            PluginType::App,
            PathBuf::from("/var/lib/plugins/includes-symlinks"),
            PluginClass::External,
        );
        assert_eq!(plugin.module(), "plugins/test-app/module");
        assert_eq!(plugin.base_url(), "public/plugins/test-app");
        assert_eq!(plugin.signature_status(), SignatureStatus::Unsigned);
    }

    #[test]
    fn test_logo_and_screenshot_normalisation() {
        let mut m = manifest("test-app", "app");
        m.info.logos.small = "img/logo_small.png".to_string();
        m.info.logos.large = "https://cdn.example.com/logo.png".to_string();
        m.info.screenshots.push(Screenshot {
            name: "img1".to_string(),
            path: "img/screenshot1.png".to_string(),
        });

        let plugin = Plugin::new(
            m,
            PluginType::App,
            PathBuf::from("/var/lib/plugins/test-app"),
            PluginClass::External,
        );
        let info = &plugin.manifest().info;
        assert_eq!(info.logos.small, "public/plugins/test-app/img/logo_small.png");
        assert_eq!(info.logos.large, "https://cdn.example.com/logo.png");
        assert_eq!(info.screenshots[0].path, "public/plugins/test-app/img/screenshot1.png");
    }

    #[test]
    fn test_default_logo_by_type() {
        let plugin = Plugin::new(
            manifest("test-panel", "panel"),
            PluginType::Panel,
            PathBuf::from("/var/lib/plugins/test-panel"),
            PluginClass::External,
        );
        assert_eq!(plugin.manifest().info.logos.small, "public/img/icn-panel.svg");
        assert_eq!(plugin.manifest().info.logos.large, "public/img/icn-panel.svg");
        assert_eq!(plugin.manifest().dependencies.host_version, "*");
    }

    #[test]
    fn test_include_defaults() {
        let mut m = manifest("test-app", "app");
        m.includes.push(PluginInclude {
            name: "Nginx Connections".to_string(),
            include_type: "dashboard".to_string(),
            ..Default::default()
        });
        m.includes.push(PluginInclude {
            name: "Admin".to_string(),
            include_type: "page".to_string(),
            role: "Admin".to_string(),
            slug: "custom".to_string(),
            ..Default::default()
        });

        let plugin = Plugin::new(
            m.clone(),
            PluginType::App,
            PathBuf::from("/var/lib/plugins/test-app"),
            PluginClass::External,
        );
        let includes = &plugin.manifest().includes;
        assert_eq!(includes[0].role, "Viewer");
        assert_eq!(includes[0].slug, "nginx-connections");
        assert_eq!(includes[1].role, "Admin");
        assert_eq!(includes[1].slug, "custom");

        let core = Plugin::new(
            m,
            PluginType::App,
            PathBuf::from("/srv/public/app/plugins/app/test-app"),
            PluginClass::Core,
        );
        assert_eq!(core.manifest().includes[0].role, "Viewer");
        assert!(core.manifest().includes[0].slug.is_empty());
    }

    #[tokio::test]
    async fn test_new_plugin_starts_registered() {
        let plugin = Plugin::new(
            manifest("test-ds", "datasource"),
            PluginType::DataSource,
            PathBuf::from("/var/lib/plugins/test-ds"),
            PluginClass::External,
        );
        assert_eq!(plugin.state().await, PluginState::Registered);
        assert!(plugin.last_error().await.is_none());
        assert!(!plugin.is_managed());
        assert!(plugin.parent().is_none());
    }
}
