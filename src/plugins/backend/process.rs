//! Subprocess backend client
//!
//! [`ProcessBackend`] runs a plugin's backend executable as a child process
//! and talks to it with newline-delimited JSON over stdio. A request is
//! `{"id", "method", "params"}`; the reply is `{"id", "result"}` or
//! `{"id", "error": {"code", "message"}}`. Streaming calls may emit any number
//! of `{"id", "chunk"}` lines before the final reply.

use super::{
    BackendError, BackendPlugin, BackendResult, CallResourceRequest, CallResourceResponse,
    CallResourceResponseSender, Capabilities, CheckHealthRequest, CheckHealthResult,
    CollectMetricsResult, ExitSignal, PluginContext, ProcessStatus, QueryDataRequest,
    QueryDataResponse,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

/// JSON-RPC code a plugin returns for a method it does not handle
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Platform-specific executable for a plugin's declared base name
///
/// Produces `<dir>/<executable>_<os>_<arch>` with Go-style platform names
/// (`amd64`, `arm64`, `darwin`), plus `.exe` on Windows.
pub fn executable_path(dir: &Path, executable: &str) -> PathBuf {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };

    let mut name = format!("{}_{}_{}", executable, os, arch);
    if cfg!(windows) {
        name.push_str(".exe");
    }
    dir.join(name)
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcReply {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
    #[serde(default)]
    chunk: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl From<RpcErrorBody> for BackendError {
    fn from(err: RpcErrorBody) -> Self {
        if err.code == METHOD_NOT_FOUND {
            BackendError::MethodNotImplemented
        } else {
            BackendError::Rpc {
                code: err.code,
                message: err.message,
            }
        }
    }
}

struct RpcIo {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// A live child process
struct Session {
    io: Arc<Mutex<RpcIo>>,
    kill: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

/// Backend client that owns a plugin's executable as a child process
pub struct ProcessBackend {
    plugin_id: String,
    program: PathBuf,
    args: Vec<String>,
    working_dir: PathBuf,
    status: Arc<ProcessStatus>,
    session: Mutex<Option<Session>>,
    next_id: AtomicU64,
}

impl ProcessBackend {
    pub fn new(plugin_id: impl Into<String>, program: PathBuf, working_dir: PathBuf) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            program,
            args: Vec::new(),
            working_dir,
            status: Arc::new(ProcessStatus::new()),
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Backend for a plugin directory and its manifest's `executable` name
    pub fn for_plugin(plugin_id: impl Into<String>, dir: &Path, executable: &str) -> Self {
        Self::new(plugin_id, executable_path(dir, executable), dir.to_path_buf())
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    async fn spawn_session(&self) -> BackendResult<Session> {
        tracing::debug!(
            plugin_id = %self.plugin_id,
            program = %self.program.display(),
            "Spawning plugin backend"
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Process("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Process("failed to capture stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let plugin_id = self.plugin_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(plugin_id = %plugin_id, "{}", line);
                }
            });
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let status = Arc::clone(&self.status);
        let plugin_id = self.plugin_id.clone();
        // Mark running before the monitor exists so an instant crash is not lost
        self.status.set_running();
        let monitor = tokio::spawn(async move {
            let killed = tokio::select! {
                result = child.wait() => {
                    match result {
                        Ok(code) => tracing::info!(plugin_id = %plugin_id, "Plugin process exited: {}", code),
                        Err(e) => tracing::warn!(plugin_id = %plugin_id, error = %e, "Failed to wait on plugin process"),
                    }
                    false
                }
                _ = kill_rx => true,
            };
            if killed {
                if let Err(e) = child.kill().await {
                    tracing::warn!(plugin_id = %plugin_id, error = %e, "Failed to kill plugin process");
                }
            }
            status.set_exited();
        });

        Ok(Session {
            io: Arc::new(Mutex::new(RpcIo {
                stdin,
                stdout: BufReader::new(stdout).lines(),
            })),
            kill: Some(kill_tx),
            monitor,
        })
    }

    /// Send one request and wait for its reply, forwarding chunks to `sink`
    async fn exchange(
        &self,
        method: &str,
        params: Value,
        mut sink: Option<&mut dyn CallResourceResponseSender>,
    ) -> BackendResult<Value> {
        if self.status.is_decommissioned() {
            return Err(BackendError::Unavailable(format!(
                "plugin '{}' is decommissioned",
                self.plugin_id
            )));
        }

        let io = {
            let session = self.session.lock().await;
            match session.as_ref() {
                Some(session) if !self.status.exited() => Arc::clone(&session.io),
                _ => {
                    return Err(BackendError::Unavailable(format!(
                        "plugin '{}' is not running",
                        self.plugin_id
                    )));
                }
            }
        };
        let mut io = io.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_vec(&RpcRequest { id, method, params })
            .map_err(|e| BackendError::Process(format!("failed to encode request: {}", e)))?;
        line.push(b'\n');
        io.stdin.write_all(&line).await?;
        io.stdin.flush().await?;

        loop {
            let Some(line) = io.stdout.next_line().await? else {
                return Err(BackendError::Process(format!(
                    "plugin '{}' closed its output",
                    self.plugin_id
                )));
            };
            if line.trim().is_empty() {
                continue;
            }

            let reply: RpcReply = serde_json::from_str(&line)
                .map_err(|e| BackendError::Process(format!("malformed reply: {}", e)))?;

            if reply.id != id {
                // Reply to a call whose caller gave up
                tracing::debug!(plugin_id = %self.plugin_id, id = reply.id, "Discarding stale reply");
                continue;
            }

            if let Some(chunk) = reply.chunk {
                if let Some(sink) = sink.as_mut() {
                    sink.send(decode(chunk)?).await?;
                }
                continue;
            }

            if let Some(err) = reply.error {
                return Err(err.into());
            }

            return Ok(reply.result.unwrap_or(Value::Null));
        }
    }

    async fn call<P: Serialize + Sync, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> BackendResult<R> {
        let params = serde_json::to_value(params)
            .map_err(|e| BackendError::Process(format!("failed to encode params: {}", e)))?;
        let result = self.exchange(method, params, None).await?;
        decode(result)
    }
}

fn decode<R: DeserializeOwned>(value: Value) -> BackendResult<R> {
    serde_json::from_value(value)
        .map_err(|e| BackendError::Process(format!("unexpected reply payload: {}", e)))
}

#[async_trait]
impl BackendPlugin for ProcessBackend {
    fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    fn is_managed(&self) -> bool {
        true
    }

    fn exited(&self) -> bool {
        self.status.exited()
    }

    fn exit_signal(&self) -> ExitSignal {
        self.status.subscribe()
    }

    fn decommission(&self) {
        self.status.decommission();
    }

    fn is_decommissioned(&self) -> bool {
        self.status.is_decommissioned()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    async fn start(&self) -> BackendResult<()> {
        if self.status.is_decommissioned() {
            return Err(BackendError::Unavailable(format!(
                "plugin '{}' is decommissioned",
                self.plugin_id
            )));
        }

        let mut session = self.session.lock().await;
        if session.is_some() && !self.status.exited() {
            return Ok(());
        }

        // Reap the previous (crashed) process before replacing it
        if let Some(old) = session.take() {
            let _ = old.monitor.await;
        }

        *session = Some(self.spawn_session().await?);

        tracing::info!(plugin_id = %self.plugin_id, "Plugin backend started");
        Ok(())
    }

    async fn stop(&self) -> BackendResult<()> {
        let Some(mut old) = self.session.lock().await.take() else {
            return Ok(());
        };

        if let Some(kill) = old.kill.take() {
            let _ = kill.send(());
        }
        if let Err(e) = old.monitor.await {
            tracing::warn!(plugin_id = %self.plugin_id, error = %e, "Plugin monitor task failed");
        }
        self.status.set_exited();

        tracing::info!(plugin_id = %self.plugin_id, "Plugin backend stopped");
        Ok(())
    }

    async fn collect_metrics(&self, ctx: &PluginContext) -> BackendResult<CollectMetricsResult> {
        self.call("collectMetrics", ctx).await
    }

    async fn check_health(&self, req: &CheckHealthRequest) -> BackendResult<CheckHealthResult> {
        self.call("checkHealth", req).await
    }

    async fn query_data(&self, req: &QueryDataRequest) -> BackendResult<QueryDataResponse> {
        self.call("queryData", req).await
    }

    async fn call_resource(
        &self,
        req: &CallResourceRequest,
        sender: &mut dyn CallResourceResponseSender,
    ) -> BackendResult<()> {
        let params = serde_json::to_value(req)
            .map_err(|e| BackendError::Process(format!("failed to encode params: {}", e)))?;
        let result = self.exchange("callResource", params, Some(&mut *sender)).await?;

        // A final non-null result is the last (or only) response chunk
        if !result.is_null() {
            let response: CallResourceResponse = decode(result)?;
            sender.send(response).await?;
        }
        Ok(())
    }
}

impl Drop for ProcessBackend {
    fn drop(&mut self) {
        if let Ok(mut session) = self.session.try_lock() {
            if let Some(kill) = session.as_mut().and_then(|s| s.kill.take()) {
                let _ = kill.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::backend::HealthStatus;
    use std::time::Duration;

    #[test]
    fn test_executable_path_has_platform_suffix() {
        let path = executable_path(Path::new("/plugins/test-ds"), "gpx_test");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();

        assert!(name.starts_with("gpx_test_"));
        assert_eq!(path.parent(), Some(Path::new("/plugins/test-ds")));
        if cfg!(all(target_os = "linux", target_arch = "x86_64")) {
            assert_eq!(name, "gpx_test_linux_amd64");
        }
    }

    #[test]
    fn test_method_not_found_maps_to_not_implemented() {
        let err: BackendError = RpcErrorBody {
            code: METHOD_NOT_FOUND,
            message: "nope".to_string(),
        }
        .into();
        assert!(matches!(err, BackendError::MethodNotImplemented));

        let err: BackendError = RpcErrorBody {
            code: 7,
            message: "boom".to_string(),
        }
        .into();
        assert!(matches!(err, BackendError::Rpc { code: 7, .. }));
    }

    #[test]
    fn test_reply_framing() {
        let reply: RpcReply =
            serde_json::from_str(r#"{"id":3,"chunk":{"status":200,"body":"aGk="}}"#).unwrap();
        assert_eq!(reply.id, 3);
        assert!(reply.result.is_none());
        let chunk: CallResourceResponse = decode(reply.chunk.unwrap()).unwrap();
        assert_eq!(chunk.status, 200);
        assert_eq!(chunk.body, b"hi");
    }

    #[tokio::test]
    async fn test_calls_on_stopped_backend_are_unavailable() {
        let backend = ProcessBackend::new("idle", PathBuf::from("/nonexistent"), PathBuf::from("/"));
        let err = backend
            .check_health(&CheckHealthRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
        assert!(backend.exited());

        // Stopping something never started is fine
        backend.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_decommissioned_backend_refuses_start() {
        let backend = ProcessBackend::new("gone", PathBuf::from("/nonexistent"), PathBuf::from("/"));
        backend.decommission();
        assert!(matches!(
            backend.start().await,
            Err(BackendError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_executable_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::for_plugin("missing", dir.path(), "gpx_missing");
        assert!(matches!(backend.start().await, Err(BackendError::Io(_))));
        assert!(backend.exited());
    }

    #[cfg(unix)]
    const ECHO_HEALTH: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/^{"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"checkHealth"'*)
      printf '{"id":%s,"result":{"status":"ok","message":"fine"}}\n' "$id" ;;
    *'"method":"callResource"'*)
      printf '{"id":%s,"chunk":{"status":200,"body":"YQ=="}}\n' "$id"
      printf '{"id":%s,"result":{"status":200,"body":"Yg=="}}\n' "$id" ;;
    *)
      printf '{"id":%s,"error":{"code":-32601,"message":"unknown"}}\n' "$id" ;;
  esac
done
"#;

    #[cfg(unix)]
    fn shell_backend(script: &str) -> ProcessBackend {
        ProcessBackend::new("shell", PathBuf::from("/bin/sh"), std::env::temp_dir())
            .with_args(vec!["-c".to_string(), script.to_string()])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rpc_round_trip_over_stdio() {
        let backend = shell_backend(ECHO_HEALTH);
        backend.start().await.unwrap();
        assert!(!backend.exited());

        let health = backend
            .check_health(&CheckHealthRequest::default())
            .await
            .unwrap();
        assert_eq!(health.status, HealthStatus::Ok);
        assert_eq!(health.message, "fine");

        let mut chunks: Vec<CallResourceResponse> = Vec::new();
        backend
            .call_resource(&CallResourceRequest::default(), &mut chunks)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].body, b"a");
        assert_eq!(chunks[1].body, b"b");

        let err = backend
            .collect_metrics(&PluginContext::new("shell"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::MethodNotImplemented));

        backend.stop().await.unwrap();
        assert!(backend.exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_fires_exit_signal() {
        let backend = shell_backend("exit 3");
        backend.start().await.unwrap();
        let mut signal = backend.exit_signal();

        let fired = tokio::time::timeout(Duration::from_secs(5), signal.wait())
            .await
            .unwrap();
        assert!(fired);
        assert!(backend.exited());
    }
}
