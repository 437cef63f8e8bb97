//! JSON-RPC 2.0 wire types for the MCP stdio transport.
//!
//! Each frame is a single JSON object terminated by `\n`:
//!
//! ```text
//! → {"jsonrpc":"2.0","id":1,"method":"initialize","params":{...}}\n
//! ← {"jsonrpc":"2.0","id":1,"result":{...}}\n
//! ← {"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"..."}}\n
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The JSON-RPC version string sent on every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision sent during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// A request expecting a correlated response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always "2.0".
    pub jsonrpc: String,
    /// Per-connection monotonic id.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a request.
    #[must_use]
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A notification (no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Always "2.0".
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
        }
    }
}

/// A response frame. Frames without an `id` are server-initiated
/// notifications and are ignored by the reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Correlation id.
    #[serde(default)]
    pub id: Option<u64>,
    /// Success payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl JsonRpcResponse {
    /// Convert to a `Result`, treating `error` as the failure case and a
    /// missing `result` as `null`.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Optional structured data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// `initialize` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// MCP protocol revision.
    pub protocol_version: String,
    /// Client capabilities (empty object today).
    pub capabilities: Value,
    /// Client identification.
    pub client_info: ClientInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            capabilities: serde_json::json!({}),
            client_info: ClientInfo::default(),
        }
    }
}

/// Client name and version sent during `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Client version.
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "steward".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

/// One tool advertised by a server's `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTool {
    /// Tool name on the server.
    pub name: String,
    /// Tool description.
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema for the tool's input.
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Option<Value>,
}

/// `tools/list` result payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsListResult {
    /// Advertised tools.
    #[serde(default)]
    pub tools: Vec<RemoteTool>,
}

/// `tools/call` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    /// Tool name on the server.
    pub name: String,
    /// Tool arguments.
    pub arguments: Value,
}

/// One content item of a `tools/call` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContentItem {
    /// Content type ("text", "image", ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Text payload for text items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// `tools/call` result payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Ordered content items.
    #[serde(default)]
    pub content: Vec<ToolContentItem>,
    /// Server-flagged failure.
    #[serde(default, rename = "isError")]
    pub is_error: Option<bool>,
}

impl ToolCallResult {
    /// Render the content as a single value: text items joined with
    /// newlines, non-text items passed through as JSON.
    #[must_use]
    pub fn render(&self) -> Value {
        let texts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|item| item.text.as_deref())
            .collect();
        if texts.len() == self.content.len() {
            Value::String(texts.join("\n"))
        } else {
            serde_json::to_value(&self.content).unwrap_or(Value::Null)
        }
    }
}
