//! Plugin manifest schema
//!
//! Defines the structure of the `plugin.json` file shipped in every plugin
//! directory. The schema is versioned outside this crate, so parsing is
//! lenient: unknown fields are ignored and optional sections default.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// File name of a plugin manifest
pub const MANIFEST_FILE_NAME: &str = "plugin.json";

/// Kind of plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    /// Provides data to the host through queries
    #[serde(rename = "datasource")]
    DataSource,
    /// Visualises data inside dashboards
    Panel,
    /// Bundles pages, dashboards and nested plugins
    App,
}

impl PluginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginType::DataSource => "datasource",
            PluginType::Panel => "panel",
            PluginType::App => "app",
        }
    }

    /// Parse the manifest's raw `type` field
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "datasource" => Some(PluginType::DataSource),
            "panel" => Some(PluginType::Panel),
            "app" => Some(PluginType::App),
            _ => None,
        }
    }
}

impl std::fmt::Display for PluginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plugin manifest - root structure of a `plugin.json` file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Plugin ID (must be unique)
    #[serde(default)]
    pub id: String,

    /// Raw plugin type; checked against [`PluginType`] during validation
    #[serde(rename = "type", default)]
    pub plugin_type: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub info: PluginInfo,

    #[serde(default)]
    pub dependencies: PluginDependencies,

    /// Dashboards, pages and panels shipped with the plugin
    #[serde(default)]
    pub includes: Vec<PluginInclude>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// Release state such as "alpha" or "beta"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Plugin has a backend component
    #[serde(default)]
    pub backend: bool,

    /// Backend executable base name; the platform suffix is added at start-up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,

    #[serde(default)]
    pub streaming: bool,

    #[serde(default)]
    pub metrics: bool,

    #[serde(default)]
    pub alerting: bool,

    #[serde(default)]
    pub logs: bool,

    #[serde(default)]
    pub annotations: bool,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query_options: HashMap<String, bool>,
}

impl PluginManifest {
    /// Typed plugin kind, `None` when the manifest declares an unknown type
    pub fn kind(&self) -> Option<PluginType> {
        PluginType::parse(&self.plugin_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    #[serde(default)]
    pub author: InfoLink,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<InfoLink>,

    #[serde(default)]
    pub logos: PluginLogos,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub screenshots: Vec<Screenshot>,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub updated: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfoLink {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginLogos {
    #[serde(default)]
    pub small: String,
    #[serde(default)]
    pub large: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Screenshot {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
}

/// Requirements on the host and on other plugins
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDependencies {
    /// Host version range, "*" when unspecified
    #[serde(default)]
    pub host_version: String,

    #[serde(default)]
    pub plugins: Vec<PluginDependency>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginDependency {
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Dashboard, page or panel shipped inside a plugin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInclude {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    #[serde(rename = "type", default)]
    pub include_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub component: String,

    /// Minimum role required to see the include, "Viewer" when unspecified
    #[serde(default)]
    pub role: String,

    #[serde(default)]
    pub slug: String,

    #[serde(default)]
    pub add_to_nav: bool,

    #[serde(default)]
    pub default_nav: bool,
}

/// Default role granted to includes that do not declare one
pub const DEFAULT_INCLUDE_ROLE: &str = "Viewer";

/// Turn a display name into a URL slug ("Nginx Connections" -> "nginx-connections")
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;

    for c in name.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }

    slug
}
