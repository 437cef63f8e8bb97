//! MCP plugin transport: subprocess JSON-RPC clients and a lazy catalog.
//!
//! The transport layers are:
//! - [`protocol`] — JSON-RPC 2.0 wire types and MCP payload shapes
//! - [`config`] — `.mcp.json` loading with hierarchical merge
//! - [`connection`] — one subprocess: handshake, correlation, drain
//! - [`client`] — many servers: lazy loading, search, retry, dead letter

pub mod client;
pub mod config;
pub mod connection;
pub mod protocol;

pub use client::{DeadLetterEntry, DeadLetterSink, LazyConfig, McpClient, ToolSummary};
pub use config::{McpConfig, ServerConfig, expand_env};
pub use connection::{ConnectionState, DEFAULT_REQUEST_TIMEOUT, McpConnection};
pub use protocol::{PROTOCOL_VERSION, RemoteTool};
