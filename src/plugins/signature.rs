//! Plugin signature checking
//!
//! A signed plugin ships a `MANIFEST.txt` listing the SHA-256 digest of every
//! file in its directory, wrapped in a PGP clear-signed message. The
//! [`SignatureValidator`] reports what it finds; the [`SignaturePolicy`]
//! decides which findings are errors once the plugin graph is linked.

use super::manifest::PluginManifest;
use super::plugin::{Plugin, PluginClass};
use super::{PluginError, PluginResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use walkdir::WalkDir;

/// Name of the signed digest file inside a plugin directory
pub const MANIFEST_TXT: &str = "MANIFEST.txt";

const PGP_MESSAGE_HEADER: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const PGP_SIGNATURE_HEADER: &str = "-----BEGIN PGP SIGNATURE-----";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureStatus {
    /// Core plugin, never checked
    Internal,
    Valid,
    Invalid,
    /// Files changed after signing
    Modified,
    Unsigned,
}

impl SignatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureStatus::Internal => "internal",
            SignatureStatus::Valid => "valid",
            SignatureStatus::Invalid => "invalid",
            SignatureStatus::Modified => "modified",
            SignatureStatus::Unsigned => "unsigned",
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, SignatureStatus::Valid)
    }
}

impl std::fmt::Display for SignatureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who signed a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureType {
    #[serde(alias = "grafana")]
    FirstParty,
    #[serde(alias = "commercial")]
    Community,
    Private,
}

/// Outcome of checking a plugin directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub status: SignatureStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_type: Option<SignatureType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
}

impl SignatureInfo {
    fn with_status(status: SignatureStatus) -> Self {
        Self {
            status,
            signature_type: None,
            org: None,
        }
    }

    pub fn internal() -> Self {
        Self::with_status(SignatureStatus::Internal)
    }

    pub fn unsigned() -> Self {
        Self::with_status(SignatureStatus::Unsigned)
    }

    pub fn invalid() -> Self {
        Self::with_status(SignatureStatus::Invalid)
    }

    pub fn modified() -> Self {
        Self::with_status(SignatureStatus::Modified)
    }

    pub fn valid(signature_type: SignatureType, org: impl Into<String>) -> Self {
        Self {
            status: SignatureStatus::Valid,
            signature_type: Some(signature_type),
            org: Some(org.into()),
        }
    }
}

/// Signature problem recorded on a descriptor
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Plugin '{plugin_id}' is unsigned")]
    Unsigned { plugin_id: String },

    #[error("Plugin '{plugin_id}' has an invalid signature")]
    Invalid { plugin_id: String },

    #[error("Plugin '{plugin_id}' has been modified since it was signed")]
    Modified { plugin_id: String },
}

impl SignatureError {
    pub fn plugin_id(&self) -> &str {
        match self {
            SignatureError::Unsigned { plugin_id }
            | SignatureError::Invalid { plugin_id }
            | SignatureError::Modified { plugin_id } => plugin_id,
        }
    }

    pub fn status(&self) -> SignatureStatus {
        match self {
            SignatureError::Unsigned { .. } => SignatureStatus::Unsigned,
            SignatureError::Invalid { .. } => SignatureStatus::Invalid,
            SignatureError::Modified { .. } => SignatureStatus::Modified,
        }
    }
}

/// Checks a plugin directory against its signed manifest
#[cfg_attr(test, mockall::automock)]
pub trait SignatureValidator: Send + Sync {
    /// Report the signature status of `dir`
    ///
    /// Only failures to inspect the directory are errors; a bad signature is
    /// a status.
    fn validate(&self, dir: &Path, manifest: &PluginManifest) -> PluginResult<SignatureInfo>;
}

/// Signed content of `MANIFEST.txt`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedManifest {
    #[serde(default)]
    signature_type: Option<SignatureType>,
    #[serde(default)]
    signed_by_org_name: String,
    plugin: String,
    version: String,
    #[serde(default)]
    files: BTreeMap<String, String>,
}

/// Default validator: checks the ID, version and per-file SHA-256 digests
/// listed in `MANIFEST.txt`
///
/// The armoured PGP block is required to be present but is not verified
/// cryptographically; key distribution is left to the host.
#[derive(Debug, Default, Clone)]
pub struct ManifestDigestValidator;

impl ManifestDigestValidator {
    pub fn new() -> Self {
        Self
    }

    /// Extract the JSON payload of a (possibly clear-signed) manifest
    fn signed_body(text: &str) -> Option<&str> {
        if !text.trim_start().starts_with(PGP_MESSAGE_HEADER) {
            return Some(text);
        }

        // Armour headers end at the first blank line
        let after_header = text.find(PGP_MESSAGE_HEADER)? + PGP_MESSAGE_HEADER.len();
        let rest = &text[after_header..];
        let body_start = rest
            .find("\n\n")
            .map(|i| i + 2)
            .or_else(|| rest.find("\r\n\r\n").map(|i| i + 4))?;
        let body = &rest[body_start..];
        let body_end = body.find(PGP_SIGNATURE_HEADER)?;
        Some(&body[..body_end])
    }

    fn file_digest(path: &Path) -> std::io::Result<String> {
        let bytes = std::fs::read(path)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Every regular file under `dir` (relative, `/`-separated), minus the manifest itself
    fn plugin_files(dir: &Path) -> PluginResult<HashSet<String>> {
        let mut files = HashSet::new();
        for entry in WalkDir::new(dir).follow_links(true) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
                PluginError::io(path, source)
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(dir) else {
                continue;
            };
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if rel != MANIFEST_TXT {
                files.insert(rel);
            }
        }
        Ok(files)
    }
}

impl SignatureValidator for ManifestDigestValidator {
    fn validate(&self, dir: &Path, manifest: &PluginManifest) -> PluginResult<SignatureInfo> {
        let manifest_path = dir.join(MANIFEST_TXT);
        let text = match std::fs::read_to_string(&manifest_path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(plugin_id = %manifest.id, "No {} found", MANIFEST_TXT);
                return Ok(SignatureInfo::unsigned());
            }
            Err(e) => return Err(PluginError::io(manifest_path, e)),
        };

        let Some(body) = Self::signed_body(&text) else {
            tracing::warn!(plugin_id = %manifest.id, "Malformed clear-signed {}", MANIFEST_TXT);
            return Ok(SignatureInfo::invalid());
        };

        let signed: SignedManifest = match serde_json::from_str(body.trim()) {
            Ok(signed) => signed,
            Err(e) => {
                tracing::warn!(plugin_id = %manifest.id, error = %e, "Unreadable {}", MANIFEST_TXT);
                return Ok(SignatureInfo::invalid());
            }
        };

        if signed.plugin != manifest.id || signed.version != manifest.info.version {
            tracing::warn!(
                plugin_id = %manifest.id,
                "{} was signed for {} v{}",
                MANIFEST_TXT,
                signed.plugin,
                signed.version
            );
            return Ok(SignatureInfo::invalid());
        }

        for (file, expected) in &signed.files {
            let path = dir.join(file);
            match Self::file_digest(&path) {
                Ok(actual) if actual.eq_ignore_ascii_case(expected) => {}
                Ok(_) => {
                    tracing::warn!(plugin_id = %manifest.id, file = %file, "Digest mismatch");
                    return Ok(SignatureInfo::modified());
                }
                Err(_) => {
                    tracing::warn!(plugin_id = %manifest.id, file = %file, "Signed file is missing");
                    return Ok(SignatureInfo::modified());
                }
            }
        }

        let unlisted: Vec<String> = Self::plugin_files(dir)?
            .into_iter()
            .filter(|f| !signed.files.contains_key(f))
            .collect();
        if !unlisted.is_empty() {
            tracing::warn!(plugin_id = %manifest.id, files = ?unlisted, "Files not covered by signature");
            return Ok(SignatureInfo::modified());
        }

        Ok(SignatureInfo::valid(
            signed.signature_type.unwrap_or(SignatureType::Private),
            signed.signed_by_org_name,
        ))
    }
}

/// Turns signature statuses into admission errors for a linked batch
#[derive(Debug, Default, Clone)]
pub struct SignaturePolicy {
    allow_unsigned: HashSet<String>,
}

impl SignaturePolicy {
    pub fn new(allow_unsigned: impl IntoIterator<Item = String>) -> Self {
        Self {
            allow_unsigned: allow_unsigned.into_iter().collect(),
        }
    }

    pub fn allows_unsigned(&self, plugin_id: &str) -> bool {
        self.allow_unsigned.contains(plugin_id)
    }

    /// Record a signature error (or none) on every plugin of a linked batch
    ///
    /// Children of a validly signed parent take over the parent's signature.
    pub fn apply(&self, plugins: &mut [Plugin]) {
        let signed_parents: HashMap<String, _> = plugins
            .iter()
            .filter(|p| p.signature_status().is_valid())
            .map(|p| (p.id().to_string(), p.signature().clone()))
            .collect();

        for plugin in plugins.iter_mut() {
            if let Some(parent_sig) = plugin.parent().and_then(|id| signed_parents.get(id)) {
                plugin.set_signature(parent_sig.clone());
            }
            let error = self.check(plugin);
            if let Some(err) = &error {
                tracing::warn!(plugin_id = %plugin.id(), error = %err, "Plugin signature check failed");
            }
            plugin.set_signature_error(error);
        }
    }

    fn check(&self, plugin: &Plugin) -> Option<SignatureError> {
        let plugin_id = plugin.id().to_string();
        match plugin.signature_status() {
            SignatureStatus::Internal | SignatureStatus::Valid => None,
            _ if plugin.class() == PluginClass::Bundled => None,
            SignatureStatus::Unsigned if self.allows_unsigned(&plugin_id) => {
                tracing::warn!(plugin_id = %plugin_id, "Running unsigned plugin");
                None
            }
            SignatureStatus::Unsigned => Some(SignatureError::Unsigned { plugin_id }),
            SignatureStatus::Invalid => Some(SignatureError::Invalid { plugin_id }),
            SignatureStatus::Modified => Some(SignatureError::Modified { plugin_id }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::manifest::PluginType;
    use std::path::PathBuf;

    fn manifest(id: &str, version: &str) -> PluginManifest {
        let mut m = PluginManifest {
            id: id.to_string(),
            plugin_type: "datasource".to_string(),
            ..Default::default()
        };
        m.info.version = version.to_string();
        m
    }

    fn sha(content: &str) -> String {
        hex::encode(Sha256::digest(content.as_bytes()))
    }

    fn write_signed(dir: &Path, files: &[(&str, &str)], plugin: &str, version: &str) {
        let mut listed = serde_json::Map::new();
        for (name, content) in files {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&path, content).unwrap();
            listed.insert(name.to_string(), serde_json::Value::String(sha(content)));
        }
        let body = serde_json::json!({
            "manifestVersion": "2.0.0",
            "signatureType": "grafana",
            "signedByOrg": "grafana",
            "signedByOrgName": "Grafana Labs",
            "plugin": plugin,
            "version": version,
            "files": listed,
        });
        let text = format!(
            "{}\nHash: SHA512\n\n{}\n{}\nVersion: OpenPGP.js v4.10.1\n\nwsBcBAEBCAAQBQJf\n-----END PGP SIGNATURE-----\n",
            PGP_MESSAGE_HEADER,
            serde_json::to_string_pretty(&body).unwrap(),
            PGP_SIGNATURE_HEADER
        );
        std::fs::write(dir.join(MANIFEST_TXT), text).unwrap();
    }

    #[test]
    fn test_unsigned_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let info = ManifestDigestValidator::new()
            .validate(dir.path(), &manifest("test", "1.0.0"))
            .unwrap();
        assert_eq!(info.status, SignatureStatus::Unsigned);
    }

    #[test]
    fn test_valid_signature() {
        let dir = tempfile::tempdir().unwrap();
        write_signed(
            dir.path(),
            &[("plugin.json", "{}"), ("img/logo.svg", "<svg/>")],
            "test",
            "1.0.0",
        );

        let info = ManifestDigestValidator::new()
            .validate(dir.path(), &manifest("test", "1.0.0"))
            .unwrap();
        assert_eq!(info, SignatureInfo::valid(SignatureType::FirstParty, "Grafana Labs"));
    }

    #[test]
    fn test_modified_file() {
        let dir = tempfile::tempdir().unwrap();
        write_signed(dir.path(), &[("plugin.json", "{}")], "test", "1.0.0");
        std::fs::write(dir.path().join("plugin.json"), "{ \"tampered\": true }").unwrap();

        let info = ManifestDigestValidator::new()
            .validate(dir.path(), &manifest("test", "1.0.0"))
            .unwrap();
        assert_eq!(info.status, SignatureStatus::Modified);
    }

    #[test]
    fn test_unlisted_file_is_modified() {
        let dir = tempfile::tempdir().unwrap();
        write_signed(dir.path(), &[("plugin.json", "{}")], "test", "1.0.0");
        std::fs::write(dir.path().join("extra.js"), "alert(1)").unwrap();

        let info = ManifestDigestValidator::new()
            .validate(dir.path(), &manifest("test", "1.0.0"))
            .unwrap();
        assert_eq!(info.status, SignatureStatus::Modified);
    }

    #[test]
    fn test_wrong_plugin_or_version_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        write_signed(dir.path(), &[("plugin.json", "{}")], "other", "1.0.0");
        let info = ManifestDigestValidator::new()
            .validate(dir.path(), &manifest("test", "1.0.0"))
            .unwrap();
        assert_eq!(info.status, SignatureStatus::Invalid);

        let info = ManifestDigestValidator::new()
            .validate(dir.path(), &manifest("other", "2.0.0"))
            .unwrap();
        assert_eq!(info.status, SignatureStatus::Invalid);
    }

    #[test]
    fn test_truncated_armour_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_TXT),
            format!("{}\nHash: SHA512\n\n{{\"plugin\":\"test\"}}\n", PGP_MESSAGE_HEADER),
        )
        .unwrap();
        let info = ManifestDigestValidator::new()
            .validate(dir.path(), &manifest("test", "1.0.0"))
            .unwrap();
        assert_eq!(info.status, SignatureStatus::Invalid);
    }

    fn plugin(id: &str, class: PluginClass, sig: SignatureInfo) -> Plugin {
        Plugin::new(
            manifest(id, "1.0.0"),
            PluginType::DataSource,
            PathBuf::from(format!("/plugins/{}", id)),
            class,
        )
        .with_signature(sig)
    }

    #[test]
    fn test_policy_rules() {
        let policy = SignaturePolicy::new(vec!["allowed".to_string()]);
        let mut batch = vec![
            plugin("valid", PluginClass::External, SignatureInfo::valid(SignatureType::Community, "Org")),
            plugin("unsigned", PluginClass::External, SignatureInfo::unsigned()),
            plugin("allowed", PluginClass::External, SignatureInfo::unsigned()),
            plugin("bundled", PluginClass::Bundled, SignatureInfo::unsigned()),
            plugin("modified", PluginClass::External, SignatureInfo::modified()),
            plugin("invalid", PluginClass::Unknown, SignatureInfo::invalid()),
        ];
        policy.apply(&mut batch);

        let err = |i: usize| batch[i].signature_error().cloned();
        assert_eq!(err(0), None);
        assert_eq!(
            err(1),
            Some(SignatureError::Unsigned {
                plugin_id: "unsigned".to_string()
            })
        );
        assert_eq!(err(2), None);
        assert_eq!(err(3), None);
        assert_eq!(err(4).map(|e| e.status()), Some(SignatureStatus::Modified));
        assert_eq!(err(5).map(|e| e.status()), Some(SignatureStatus::Invalid));
    }

    #[test]
    fn test_child_inherits_valid_parent_signature() {
        let policy = SignaturePolicy::default();
        let parent = plugin(
            "parent",
            PluginClass::External,
            SignatureInfo::valid(SignatureType::FirstParty, "Grafana Labs"),
        );
        let mut child = plugin("child", PluginClass::External, SignatureInfo::unsigned());
        child.set_parent("parent".to_string());

        let mut batch = vec![parent, child];
        policy.apply(&mut batch);

        assert!(batch[1].signature_error().is_none());
        assert_eq!(batch[1].signature_status(), SignatureStatus::Valid);
        assert_eq!(batch[1].signature().org.as_deref(), Some("Grafana Labs"));
    }

    #[test]
    fn test_mock_validator_is_usable() {
        let mut mock = MockSignatureValidator::new();
        mock.expect_validate()
            .returning(|_, _| Ok(SignatureInfo::invalid()));
        let info = mock.validate(Path::new("/x"), &manifest("x", "1")).unwrap();
        assert_eq!(info.status, SignatureStatus::Invalid);
    }
}
