//! Backend client capability surface
//!
//! A plugin's backend is reached through [`BackendPlugin`]. Every operation
//! other than the lifecycle methods has a default that reports
//! [`BackendError::MethodNotImplemented`], so an implementation only provides
//! the capabilities it actually has.

pub mod process;

pub use process::ProcessBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Errors reported by a backend client
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Method not implemented")]
    MethodNotImplemented,

    #[error("Plugin unavailable: {0}")]
    Unavailable(String),

    #[error("Plugin call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Plugin returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Plugin process error: {0}")]
    Process(String),

    #[error("Plugin I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Io(Arc::new(err))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Which dispatch operations a backend supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub collect_metrics: bool,
    pub check_health: bool,
    pub query_data: bool,
    pub call_resource: bool,
}

impl Capabilities {
    pub const fn all() -> Self {
        Self {
            collect_metrics: true,
            check_health: true,
            query_data: true,
            call_resource: true,
        }
    }

    pub const fn none() -> Self {
        Self {
            collect_metrics: false,
            check_health: false,
            query_data: false,
            call_resource: false,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::all()
    }
}

/// Backend client of a single plugin
///
/// Implementations are shared behind `Arc` between the registry, the
/// supervisor and dispatch callers, so every method takes `&self`.
#[async_trait]
pub trait BackendPlugin: Send + Sync {
    fn plugin_id(&self) -> &str;

    /// Whether the host owns the backend's process lifecycle
    fn is_managed(&self) -> bool;

    /// True once the backend has terminated, whether stopped or crashed
    fn exited(&self) -> bool;

    /// Fresh subscription to the backend's exit notifications
    fn exit_signal(&self) -> ExitSignal;

    /// Permanently retire the backend; it must refuse further work
    fn decommission(&self);

    fn is_decommissioned(&self) -> bool;

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    async fn start(&self) -> BackendResult<()>;

    async fn stop(&self) -> BackendResult<()>;

    async fn collect_metrics(&self, _ctx: &PluginContext) -> BackendResult<CollectMetricsResult> {
        Err(BackendError::MethodNotImplemented)
    }

    async fn check_health(&self, _req: &CheckHealthRequest) -> BackendResult<CheckHealthResult> {
        Err(BackendError::MethodNotImplemented)
    }

    async fn query_data(&self, _req: &QueryDataRequest) -> BackendResult<QueryDataResponse> {
        Err(BackendError::MethodNotImplemented)
    }

    /// Stream the response of a resource call into `sender`
    async fn call_resource(
        &self,
        _req: &CallResourceRequest,
        _sender: &mut dyn CallResourceResponseSender,
    ) -> BackendResult<()> {
        Err(BackendError::MethodNotImplemented)
    }
}

/// Exit and decommission bookkeeping shared by backend implementations
///
/// The exit flag lives in a `watch` channel so supervisors can await a
/// transition to "exited" instead of polling.
#[derive(Debug)]
pub struct ProcessStatus {
    exited: watch::Sender<bool>,
    decommissioned: AtomicBool,
}

impl ProcessStatus {
    /// New status for a backend that has not been started yet
    pub fn new() -> Self {
        let (exited, _) = watch::channel(true);
        Self {
            exited,
            decommissioned: AtomicBool::new(false),
        }
    }

    pub fn set_running(&self) {
        self.exited.send_replace(false);
    }

    pub fn set_exited(&self) {
        self.exited.send_replace(true);
    }

    pub fn exited(&self) -> bool {
        *self.exited.borrow()
    }

    pub fn subscribe(&self) -> ExitSignal {
        ExitSignal {
            rx: self.exited.subscribe(),
        }
    }

    pub fn decommission(&self) {
        self.decommissioned.store(true, Ordering::SeqCst);
    }

    pub fn is_decommissioned(&self) -> bool {
        self.decommissioned.load(Ordering::SeqCst)
    }
}

impl Default for ProcessStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver side of a backend's exit notification
#[derive(Debug, Clone)]
pub struct ExitSignal {
    rx: watch::Receiver<bool>,
}

impl ExitSignal {
    /// Wait until the backend reports itself exited
    ///
    /// Returns `false` if the backend was dropped and can no longer signal.
    pub async fn wait(&mut self) -> bool {
        self.rx.wait_for(|exited| *exited).await.is_ok()
    }
}

/// Identifies the plugin (and organisation) a dispatch call is for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginContext {
    pub plugin_id: String,
    #[serde(default)]
    pub org_id: i64,
}

impl PluginContext {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            org_id: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectMetricsResult {
    /// Prometheus text exposition
    #[serde(default, with = "base64_bytes")]
    pub prometheus_metrics: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Ok,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckHealthRequest {
    pub plugin_context: PluginContext,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckHealthResult {
    #[serde(default)]
    pub status: HealthStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default, with = "base64_bytes")]
    pub json_details: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    /// Epoch milliseconds
    pub from: i64,
    pub to: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQuery {
    pub ref_id: String,
    #[serde(default)]
    pub query_type: String,
    #[serde(default)]
    pub max_data_points: i64,
    #[serde(default)]
    pub interval_ms: i64,
    #[serde(default)]
    pub time_range: TimeRange,
    /// Query model as sent by the frontend
    #[serde(default)]
    pub json: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDataRequest {
    pub plugin_context: PluginContext,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub queries: Vec<DataQuery>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataResponse {
    #[serde(default)]
    pub frames: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Responses keyed by query `ref_id`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDataResponse {
    #[serde(default)]
    pub responses: HashMap<String, DataResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResourceRequest {
    pub plugin_context: PluginContext,
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallResourceResponse {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// Sink a resource call streams its response into
#[async_trait]
pub trait CallResourceResponseSender: Send {
    async fn send(&mut self, response: CallResourceResponse) -> BackendResult<()>;
}

#[async_trait]
impl CallResourceResponseSender for mpsc::Sender<CallResourceResponse> {
    async fn send(&mut self, response: CallResourceResponse) -> BackendResult<()> {
        mpsc::Sender::send(self, response)
            .await
            .map_err(|_| BackendError::Unavailable("response receiver dropped".to_string()))
    }
}

/// Buffers every chunk; handy when the caller wants the whole response
#[async_trait]
impl CallResourceResponseSender for Vec<CallResourceResponse> {
    async fn send(&mut self, response: CallResourceResponse) -> BackendResult<()> {
        self.push(response);
        Ok(())
    }
}

/// Serde adapter encoding byte fields as standard base64 strings
pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
