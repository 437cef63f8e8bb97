//! One MCP server connection: subprocess, reader task, request correlation.
//!
//! Each connection owns a child process speaking line-delimited JSON-RPC
//! over stdio. A single reader task is the sole resolver of pending
//! requests; on process exit or read error it rejects **every** in-flight
//! request before clearing the map, so no caller is left hanging.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::config::ServerConfig;
use super::protocol::{
    InitializeParams, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ToolCallParams,
    ToolCallResult, ToolsListResult,
};
use crate::error::{Error, Result};

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Handshake complete; catalog cached.
    Connected,
    /// A failure occurred; `connect` may be retried.
    Error,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<JsonRpcResponse>>>>>;
type SharedState = Arc<Mutex<ConnectionState>>;

/// A connection to one MCP server subprocess.
#[derive(Debug)]
pub struct McpConnection {
    name: String,
    config: ServerConfig,
    state: SharedState,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    pending: PendingMap,
    next_id: u64,
    tools: Vec<super::protocol::RemoteTool>,
    reader: Option<JoinHandle<()>>,
    request_timeout: Duration,
}

impl McpConnection {
    /// Create a disconnected connection.
    #[must_use]
    pub fn new(name: impl Into<String>, config: ServerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            child: None,
            stdin: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: 1,
            tools: Vec::new(),
            reader: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the per-request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Server name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Error)
    }

    /// Cached tool catalog from the handshake.
    #[must_use]
    pub fn tools(&self) -> &[super::protocol::RemoteTool] {
        &self.tools
    }

    /// In-flight request count (drained to zero on process exit).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Spawn the subprocess and run the MCP handshake:
    /// `initialize` → `notifications/initialized` → `tools/list`.
    ///
    /// # Errors
    ///
    /// Any failure transitions the connection to [`ConnectionState::Error`],
    /// rejects all pending requests, and returns the failure. `connect` may
    /// be called again to retry.
    pub async fn connect(&mut self) -> Result<()> {
        set_state(&self.state, ConnectionState::Connecting);

        match self.connect_inner().await {
            Ok(()) => {
                set_state(&self.state, ConnectionState::Connected);
                debug!(server = %self.name, tools = self.tools.len(), "mcp server connected");
                Ok(())
            }
            Err(err) => {
                set_state(&self.state, ConnectionState::Error);
                drain_pending(&self.pending, &self.name, "connection failed");
                Err(err)
            }
        }
    }

    async fn connect_inner(&mut self) -> Result<()> {
        let mut command = tokio::process::Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::mcp_unavailable(&self.name, format!("failed to spawn '{}': {e}", self.config.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::mcp_unavailable(&self.name, "child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::mcp_unavailable(&self.name, "child stdout unavailable"))?;

        self.stdin = Some(stdin);
        self.child = Some(child);
        self.reader = Some(spawn_reader(
            self.name.clone(),
            stdout,
            Arc::clone(&self.pending),
            Arc::clone(&self.state),
        ));

        // Handshake.
        let init = serde_json::to_value(InitializeParams::default())?;
        let response = self.request("initialize", Some(init)).await?;
        response
            .into_result()
            .map_err(|e| Error::mcp_protocol(&self.name, format!("initialize failed: {e}")))?;

        self.notify("notifications/initialized", None).await?;

        let response = self.request("tools/list", None).await?;
        let listed = response
            .into_result()
            .map_err(|e| Error::mcp_protocol(&self.name, format!("tools/list failed: {e}")))?;
        let catalog: ToolsListResult = serde_json::from_value(listed)
            .map_err(|e| Error::mcp_protocol(&self.name, format!("bad tools/list payload: {e}")))?;
        self.tools = catalog.tools;

        Ok(())
    }

    /// Send a request and await its correlated response.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] after the per-request deadline (the pending entry
    /// is removed), [`Error::McpServerUnavailable`] when the process is
    /// gone or the reader drained the request.
    pub async fn request(&mut self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        match self.state() {
            ConnectionState::Connected | ConnectionState::Connecting => {}
            _ => {
                return Err(Error::mcp_unavailable(&self.name, "not connected"));
            }
        }

        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }

        let request = JsonRpcRequest::new(id, method, params);
        if let Err(err) = self.write_line(&serde_json::to_string(&request)?).await {
            // The process is gone: reject everything, including this call.
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&id);
            }
            set_state(&self.state, ConnectionState::Error);
            drain_pending(&self.pending, &self.name, "write failed");
            return Err(err);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_recv_dropped)) => {
                Err(Error::mcp_unavailable(&self.name, "connection closed mid-request"))
            }
            Err(_elapsed) => {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(&id);
                }
                Err(Error::timeout(self.request_timeout))
            }
        }
    }

    /// Send a notification (no response expected).
    ///
    /// # Errors
    ///
    /// Returns [`Error::McpServerUnavailable`] when the write fails.
    pub async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        self.write_line(&serde_json::to_string(&notification)?).await
    }

    /// Call a tool on this server and render its content.
    ///
    /// # Errors
    ///
    /// Protocol-level error responses surface as [`Error::ToolExecution`];
    /// transport failures keep their own variants.
    pub async fn call_tool(&mut self, tool: &str, arguments: Value) -> Result<Value> {
        let params = serde_json::to_value(ToolCallParams {
            name: tool.to_owned(),
            arguments,
        })?;
        let response = self.request("tools/call", Some(params)).await?;
        let payload = response
            .into_result()
            .map_err(|e| Error::tool(tool, e.to_string()))?;
        let result: ToolCallResult = serde_json::from_value(payload)
            .map_err(|e| Error::mcp_protocol(&self.name, format!("bad tools/call payload: {e}")))?;
        if result.is_error == Some(true) {
            return Err(Error::tool(tool, result.render().to_string()));
        }
        Ok(result.render())
    }

    /// Kill the subprocess, reject all pending requests, and go idle.
    pub async fn disconnect(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
        self.stdin = None;
        drain_pending(&self.pending, &self.name, "disconnected");
        set_state(&self.state, ConnectionState::Disconnected);
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::mcp_unavailable(&self.name, "stdin closed"))?;
        let mut framed = line.to_owned();
        framed.push('\n');
        stdin
            .write_all(framed.as_bytes())
            .await
            .map_err(|e| Error::mcp_unavailable(&self.name, format!("write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::mcp_unavailable(&self.name, format!("flush failed: {e}")))
    }
}

fn set_state(state: &SharedState, next: ConnectionState) {
    if let Ok(mut guard) = state.lock() {
        *guard = next;
    }
}

/// Reject every pending request exactly once and clear the map.
fn drain_pending(pending: &PendingMap, server: &str, reason: &str) {
    let drained: Vec<_> = match pending.lock() {
        Ok(mut map) => map.drain().collect(),
        Err(_) => return,
    };
    for (id, sender) in drained {
        let _ = sender.send(Err(Error::mcp_unavailable(
            server,
            format!("{reason} (request {id})"),
        )));
    }
}

/// Reader task: the sole resolver of pending requests.
fn spawn_reader(
    server: String,
    stdout: tokio::process::ChildStdout,
    pending: PendingMap,
    state: SharedState,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JsonRpcResponse>(line) {
                        Ok(response) => match response.id {
                            Some(id) => {
                                let sender = pending.lock().ok().and_then(|mut p| p.remove(&id));
                                match sender {
                                    Some(tx) => {
                                        let _ = tx.send(Ok(response));
                                    }
                                    None => {
                                        warn!(server = %server, id, "response for unknown request id");
                                    }
                                }
                            }
                            // Server-initiated notification; nothing to correlate.
                            None => debug!(server = %server, "ignoring server notification"),
                        },
                        Err(err) => {
                            // Malformed frame: drop the line, keep the stream.
                            warn!(server = %server, error = %err, "dropping malformed frame");
                        }
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        // Process exited or the pipe broke: every in-flight request is
        // rejected before the map clears.
        drain_pending(&pending, &server, "server process exited");
        set_state(&state, ConnectionState::Disconnected);
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Stub server: answers the handshake and echoes tool calls, keyed off
    /// the request id parsed from each incoming line.
    const STUB_OK: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05"}}\n' "$id";;
    *'"tools/list"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo text back","inputSchema":{"type":"object"}}]}}\n' "$id";;
    *'"tools/call"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"hello"}]}}\n' "$id";;
  esac
done
"#;

    /// Stub that dies the moment a tool call arrives.
    const STUB_CRASH_ON_CALL: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id";;
    *'"tools/list"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[]}}\n' "$id";;
    *'"tools/call"'*) exit 1;;
  esac
done
"#;

    /// Stub that emits garbage before each valid reply.
    const STUB_NOISY: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  echo 'this is not json'
  case "$line" in
    *'"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id";;
    *'"tools/list"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[]}}\n' "$id";;
    *'"tools/call"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"ok"}]}}\n' "$id";;
  esac
done
"#;

    /// Stub that never answers tool calls.
    const STUB_SILENT_CALLS: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id";;
    *'"tools/list"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[]}}\n' "$id";;
  esac
done
"#;

    fn stub(script: &str) -> ServerConfig {
        ServerConfig::new("sh", &["-c", script])
    }

    #[tokio::test]
    async fn handshake_caches_catalog() {
        let mut conn = McpConnection::new("fs", stub(STUB_OK));
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.tools().len(), 1);
        assert_eq!(conn.tools()[0].name, "echo");

        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn tool_call_renders_text() {
        let mut conn = McpConnection::new("fs", stub(STUB_OK));
        conn.connect().await.unwrap();
        let result = conn.call_tool("echo", json!({"text": "hi"})).await.unwrap();
        assert_eq!(result, json!("hello"));
        assert_eq!(conn.pending_count(), 0);
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn crash_mid_call_rejects_and_drains() {
        // The in-flight call rejects, pending is empty,
        // and the connection reports disconnected.
        let mut conn = McpConnection::new("fs", stub(STUB_CRASH_ON_CALL));
        conn.connect().await.unwrap();

        let err = conn.call_tool("read_file", json!({"path": "/x"})).await.unwrap_err();
        assert!(
            matches!(err, Error::McpServerUnavailable { .. }),
            "got: {err:?}"
        );
        assert_eq!(conn.pending_count(), 0);

        // Give the reader task a beat to observe EOF and flip the state.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let mut conn = McpConnection::new("fs", stub(STUB_NOISY));
        conn.connect().await.unwrap();
        let result = conn.call_tool("echo", json!({})).await.unwrap();
        assert_eq!(result, json!("ok"));
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn request_timeout_clears_pending_entry() {
        let mut conn = McpConnection::new("fs", stub(STUB_SILENT_CALLS))
            .with_request_timeout(Duration::from_millis(200));
        conn.connect().await.unwrap();

        let err = conn.call_tool("slow", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "got: {err:?}");
        assert_eq!(conn.pending_count(), 0);
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_error_state() {
        let mut conn = McpConnection::new(
            "ghost",
            ServerConfig::new("/nonexistent/binary-xyz", &[]),
        );
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, Error::McpServerUnavailable { .. }));
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn request_after_disconnect_is_unavailable() {
        let mut conn = McpConnection::new("fs", stub(STUB_OK));
        conn.connect().await.unwrap();
        conn.disconnect().await;
        let err = conn.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, Error::McpServerUnavailable { .. }));
    }
}
