//! Multi-server MCP client with a lazily loaded tool catalog.
//!
//! One [`McpClient`] owns every configured server connection. Tool names
//! are exposed as `{server}_{tool}`; under lazy loading only short
//! summaries are surfaced until a tool is promoted by prefix, by a
//! previous call, or by the search meta-tool.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use super::config::ServerConfig;
use super::connection::{ConnectionState, McpConnection};
use super::protocol::RemoteTool;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::tool::{DangerLevel, ToolDefinition};

/// Summary description cap under lazy loading.
const SUMMARY_DESCRIPTION_CAP: usize = 100;

/// Retry backoff base for transient tool-call failures.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Tool-call attempts: the initial call plus one retry.
const CALL_ATTEMPTS: u32 = 2;

/// Short tool descriptor surfaced under lazy loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSummary {
    /// Exposed name (`{server}_{tool}`).
    pub name: String,
    /// Description truncated to 100 chars.
    pub description: String,
    /// Owning server.
    pub server_name: String,
    /// Name on the server.
    pub original_name: String,
}

/// Lazy-loading behavior.
#[derive(Debug, Clone, Default)]
pub struct LazyConfig {
    /// Whether lazy loading is on.
    pub enabled: bool,
    /// Exposed-name prefixes that always load full definitions.
    pub always_load: Vec<String>,
}

/// A failed operation persisted for later inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// `mcp:{server}:{tool}`.
    pub operation: String,
    /// The call arguments.
    pub args: Value,
    /// The failure.
    pub error: String,
    /// Owning session, when known.
    pub session_id: Option<String>,
}

/// Sink for non-recoverable failures.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Persist one entry. Best-effort.
    async fn record(&self, entry: DeadLetterEntry);
}

type SharedConnection = Arc<AsyncMutex<McpConnection>>;

/// Client managing all MCP server connections.
pub struct McpClient {
    connections: Mutex<HashMap<String, SharedConnection>>,
    /// Cached catalogs in registration order (search tie-breaks rely on it).
    catalogs: Mutex<Vec<(String, Vec<RemoteTool>)>>,
    lazy: LazyConfig,
    loaded: Mutex<HashMap<String, HashSet<String>>>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    session_id: Option<String>,
    events: EventBus,
    request_timeout: Duration,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("lazy", &self.lazy.enabled)
            .finish_non_exhaustive()
    }
}

impl McpClient {
    /// Create a client with no servers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            catalogs: Mutex::new(Vec::new()),
            lazy: LazyConfig::default(),
            loaded: Mutex::new(HashMap::new()),
            dead_letter: None,
            session_id: None,
            events: EventBus::new(),
            request_timeout: super::connection::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Enable lazy loading.
    #[must_use]
    pub fn with_lazy_loading(mut self, lazy: LazyConfig) -> Self {
        self.lazy = lazy;
        self
    }

    /// Attach a dead-letter sink.
    #[must_use]
    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    /// Tag dead-letter entries with a session id.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Share an event bus (defaults to a private one).
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Override the per-request timeout applied to new connections.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Register a server without connecting it.
    pub fn register_server(&self, name: impl Into<String>, config: ServerConfig) {
        let name = name.into();
        let connection =
            McpConnection::new(name.clone(), config).with_request_timeout(self.request_timeout);
        if let Ok(mut connections) = self.connections.lock() {
            connections.insert(name, Arc::new(AsyncMutex::new(connection)));
        }
    }

    /// Register every server from a merged config.
    pub fn register_from_config(&self, config: &super::config::McpConfig) {
        for (name, server) in &config.servers {
            self.register_server(name.clone(), server.clone());
        }
    }

    fn connection(&self, name: &str) -> Option<SharedConnection> {
        self.connections
            .lock()
            .ok()
            .and_then(|c| c.get(name).cloned())
    }

    /// Connect a registered server and cache its catalog.
    ///
    /// # Errors
    ///
    /// Propagates handshake failures; the connection stays retryable.
    pub async fn connect_server(&self, name: &str) -> Result<()> {
        let connection = self
            .connection(name)
            .ok_or_else(|| Error::mcp_unavailable(name, "server not registered"))?;

        self.events.emit(Event::McpServerConnecting {
            server: name.to_owned(),
        });

        let mut guard = connection.lock().await;
        match guard.connect().await {
            Ok(()) => {
                let tools = guard.tools().to_vec();
                drop(guard);
                self.events.emit(Event::McpServerConnected {
                    server: name.to_owned(),
                    tools: tools.len(),
                });
                if let Ok(mut catalogs) = self.catalogs.lock() {
                    catalogs.retain(|(server, _)| server != name);
                    catalogs.push((name.to_owned(), tools));
                }
                Ok(())
            }
            Err(err) => {
                drop(guard);
                self.events.emit(Event::McpServerError {
                    server: name.to_owned(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// The state of one server.
    #[must_use]
    pub fn server_state(&self, name: &str) -> Option<ConnectionState> {
        let connection = self.connection(name)?;
        // Best-effort synchronous peek; a held lock means a call is active.
        connection.try_lock().map(|c| c.state()).ok()
    }

    /// Remove a server's tools from the catalog and kill its process.
    pub async fn disconnect_server(&self, name: &str) {
        if let Some(connection) = self.connection(name) {
            connection.lock().await.disconnect().await;
        }
        if let Ok(mut catalogs) = self.catalogs.lock() {
            catalogs.retain(|(server, _)| server != name);
        }
        self.events.emit(Event::McpServerDisconnected {
            server: name.to_owned(),
        });
    }

    /// Disconnect every server.
    pub async fn cleanup(&self) {
        let names: Vec<String> = self
            .connections
            .lock()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        for name in names {
            self.disconnect_server(&name).await;
        }
    }

    /// Exposed name for a server tool.
    #[must_use]
    pub fn exposed_name(server: &str, tool: &str) -> String {
        format!("{server}_{tool}")
    }

    /// Split an exposed name back into `(server, original)`.
    #[must_use]
    pub fn split_exposed(&self, exposed: &str) -> Option<(String, String)> {
        let catalogs = self.catalogs.lock().ok()?;
        for (server, tools) in catalogs.iter() {
            if let Some(rest) = exposed.strip_prefix(&format!("{server}_"))
                && tools.iter().any(|t| t.name == rest)
            {
                return Some((server.clone(), rest.to_owned()));
            }
        }
        None
    }

    /// Summaries for every tool on every connected server.
    #[must_use]
    pub fn summaries(&self) -> Vec<ToolSummary> {
        let catalogs = self.catalogs.lock().ok();
        let mut out = Vec::new();
        if let Some(catalogs) = catalogs {
            for (server, tools) in catalogs.iter() {
                for tool in tools {
                    let mut description = tool.description.clone().unwrap_or_default();
                    if description.chars().count() > SUMMARY_DESCRIPTION_CAP {
                        description = description.chars().take(SUMMARY_DESCRIPTION_CAP).collect();
                    }
                    out.push(ToolSummary {
                        name: Self::exposed_name(server, &tool.name),
                        description,
                        server_name: server.clone(),
                        original_name: tool.name.clone(),
                    });
                }
            }
        }
        out
    }

    /// Full definition for an exposed tool name, regardless of lazy state.
    #[must_use]
    pub fn full_definition(&self, exposed: &str) -> Option<ToolDefinition> {
        let (server, original) = self.split_exposed(exposed)?;
        let catalogs = self.catalogs.lock().ok()?;
        let (_, tools) = catalogs.iter().find(|(s, _)| *s == server)?;
        let tool = tools.iter().find(|t| t.name == original)?;
        Some(
            ToolDefinition::new(
                exposed,
                tool.description.clone().unwrap_or_default(),
                tool.input_schema
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            )
            .with_danger(DangerLevel::Moderate),
        )
    }

    /// Whether a tool's full definition is currently surfaced.
    #[must_use]
    pub fn is_loaded(&self, exposed: &str) -> bool {
        if !self.lazy.enabled {
            return true;
        }
        if self.lazy.always_load.iter().any(|p| exposed.starts_with(p.as_str())) {
            return true;
        }
        let Some((server, original)) = self.split_exposed(exposed) else {
            return false;
        };
        self.loaded
            .lock()
            .map(|l| l.get(&server).is_some_and(|s| s.contains(&original)))
            .unwrap_or(false)
    }

    /// Promote a tool to full-definition status.
    pub fn promote(&self, exposed: &str) {
        let Some((server, original)) = self.split_exposed(exposed) else {
            return;
        };
        let newly = self
            .loaded
            .lock()
            .map(|mut l| l.entry(server).or_default().insert(original))
            .unwrap_or(false);
        if newly {
            self.events.emit(Event::McpDynamicLoad {
                tool: exposed.to_owned(),
            });
        }
    }

    /// Definitions to expose to the model right now: everything when lazy
    /// loading is off, otherwise only always-load and promoted tools.
    #[must_use]
    pub fn exposed_definitions(&self) -> Vec<ToolDefinition> {
        self.summaries()
            .iter()
            .filter(|s| self.is_loaded(&s.name))
            .filter_map(|s| self.full_definition(&s.name))
            .collect()
    }

    /// Rank tools against a query.
    ///
    /// Case-insensitive, token-split scoring; ties keep insertion order.
    #[must_use]
    pub fn search_tools(&self, query: &str, limit: usize) -> Vec<ToolSummary> {
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        let summaries = self.summaries();

        let mut scored: Vec<(i64, ToolSummary)> = summaries
            .into_iter()
            .filter_map(|summary| {
                let score = score_tool(&summary, &query_lower, &terms);
                (score > 0).then_some((score, summary))
            })
            .collect();

        // Stable sort keeps insertion order for equal scores.
        scored.sort_by_key(|(score, _)| -*score);
        let results: Vec<ToolSummary> = scored.into_iter().take(limit).map(|(_, s)| s).collect();

        self.events.emit(Event::McpToolSearch {
            query: query.to_owned(),
            results: results.len(),
        });
        results
    }

    /// Call a tool by server and original name.
    ///
    /// Transient failures (timeout, connection reset) get one retry with
    /// backoff; the final failure is persisted to the dead-letter sink.
    ///
    /// # Errors
    ///
    /// [`Error::McpServerUnavailable`] when the server is gone,
    /// [`Error::ToolExecution`] for server-reported tool failures.
    pub async fn call_tool(&self, server: &str, tool: &str, args: Value) -> Result<Value> {
        self.events.emit(Event::McpToolCall {
            server: server.to_owned(),
            tool: tool.to_owned(),
        });

        match self.call_tool_attempts(server, tool, args.clone()).await {
            Ok(value) => {
                self.promote(&Self::exposed_name(server, tool));
                self.events.emit(Event::McpToolResult {
                    server: server.to_owned(),
                    tool: tool.to_owned(),
                    success: true,
                });
                Ok(value)
            }
            Err(err) => {
                self.events.emit(Event::McpToolResult {
                    server: server.to_owned(),
                    tool: tool.to_owned(),
                    success: false,
                });
                // A protocol violation quarantines the server's tools; the
                // run continues with whatever other servers offer.
                if matches!(err, Error::McpProtocol { .. }) {
                    if let Ok(mut catalogs) = self.catalogs.lock() {
                        catalogs.retain(|(name, _)| name != server);
                    }
                    self.events.emit(Event::McpServerError {
                        server: server.to_owned(),
                        message: err.to_string(),
                    });
                }
                if let Some(sink) = &self.dead_letter {
                    sink.record(DeadLetterEntry {
                        operation: format!("mcp:{server}:{tool}"),
                        args,
                        error: err.to_string(),
                        session_id: self.session_id.clone(),
                    })
                    .await;
                }
                Err(err)
            }
        }
    }

    async fn call_tool_attempts(&self, server: &str, tool: &str, args: Value) -> Result<Value> {
        let connection = self
            .connection(server)
            .ok_or_else(|| Error::mcp_unavailable(server, "server not registered"))?;

        let mut last_err = None;
        for attempt in 0..CALL_ATTEMPTS {
            if attempt > 0 {
                let backoff = RETRY_BACKOFF * 2u32.pow(attempt - 1);
                debug!(server, tool, attempt, "retrying mcp call after backoff");
                tokio::time::sleep(backoff).await;
            }

            match connection.lock().await.call_tool(tool, args.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < CALL_ATTEMPTS => {
                    warn!(server, tool, error = %err, "transient mcp failure");
                    last_err = Some(err);
                }
                Err(err) => {
                    last_err = Some(err);
                    break;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::mcp_unavailable(server, "no attempts made")))
    }

    /// Call a tool by exposed name, promoting it implicitly.
    ///
    /// # Errors
    ///
    /// [`Error::ToolExecution`] when the name does not resolve; otherwise
    /// as [`Self::call_tool`].
    pub async fn call_exposed(&self, exposed: &str, args: Value) -> Result<Value> {
        let (server, original) = self
            .split_exposed(exposed)
            .ok_or_else(|| Error::tool(exposed, "unknown MCP tool"))?;
        self.promote(exposed);
        self.call_tool(&server, &original, args).await
    }
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn score_tool(summary: &ToolSummary, query: &str, terms: &[&str]) -> i64 {
    let name = summary.name.to_lowercase();
    let original = summary.original_name.to_lowercase();
    let description = summary.description.to_lowercase();

    let mut score = 0i64;
    if original == query {
        score += 20;
    }
    for term in terms {
        if name.contains(term) {
            score += 10;
        }
        if original.contains(term) {
            score += 8;
        }
        if original.starts_with(term) {
            score += 5;
        }
        if description.contains(term) {
            score += 3;
        }
    }
    if !terms.is_empty() && terms.iter().all(|t| name.contains(t)) {
        score += 15;
    }
    if !terms.is_empty() && terms.iter().all(|t| description.contains(t)) {
        score += 5;
    }
    score
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn client_with_catalog(servers: &[(&str, &[(&str, &str)])]) -> McpClient {
        let client = McpClient::new();
        {
            let mut catalogs = client.catalogs.lock().unwrap();
            for (server, tools) in servers {
                let tools = tools
                    .iter()
                    .map(|(name, desc)| RemoteTool {
                        name: (*name).to_owned(),
                        description: Some((*desc).to_owned()),
                        input_schema: Some(serde_json::json!({"type": "object"})),
                    })
                    .collect();
                catalogs.push(((*server).to_owned(), tools));
            }
        }
        client
    }

    mod naming {
        use super::*;

        #[test]
        fn exposed_roundtrip() {
            let client = client_with_catalog(&[("fs", &[("read_file", "Read a file")])]);
            let exposed = McpClient::exposed_name("fs", "read_file");
            assert_eq!(exposed, "fs_read_file");
            assert_eq!(
                client.split_exposed(&exposed),
                Some(("fs".to_owned(), "read_file".to_owned()))
            );
        }

        #[test]
        fn unknown_exposed_name() {
            let client = client_with_catalog(&[("fs", &[("read_file", "d")])]);
            assert!(client.split_exposed("web_fetch").is_none());
            assert!(client.split_exposed("fs_missing").is_none());
        }
    }

    mod summaries {
        use super::*;

        #[test]
        fn descriptions_truncate_at_100() {
            let long = "d".repeat(250);
            let client = client_with_catalog(&[("fs", &[("read_file", long.as_str())])]);
            let summaries = client.summaries();
            assert_eq!(summaries[0].description.chars().count(), 100);
            assert_eq!(summaries[0].original_name, "read_file");
        }
    }

    mod lazy {
        use super::*;

        fn lazy_client() -> McpClient {
            let client = client_with_catalog(&[(
                "fs",
                &[("read_file", "Read a file"), ("write_file", "Write a file")],
            )]);
            McpClient {
                lazy: LazyConfig {
                    enabled: true,
                    always_load: vec!["fs_read".to_owned()],
                },
                ..client
            }
        }

        #[test]
        fn always_load_prefix_is_loaded() {
            let client = lazy_client();
            assert!(client.is_loaded("fs_read_file"));
            assert!(!client.is_loaded("fs_write_file"));
        }

        #[test]
        fn promotion_loads_a_tool() {
            let client = lazy_client();
            client.promote("fs_write_file");
            assert!(client.is_loaded("fs_write_file"));
        }

        #[test]
        fn exposed_definitions_respect_lazy_state() {
            let client = lazy_client();
            let names: Vec<String> = client
                .exposed_definitions()
                .into_iter()
                .map(|d| d.name)
                .collect();
            assert_eq!(names, vec!["fs_read_file"]);

            client.promote("fs_write_file");
            assert_eq!(client.exposed_definitions().len(), 2);
        }

        #[test]
        fn disabled_lazy_loads_everything() {
            let client = client_with_catalog(&[("fs", &[("a", "x"), ("b", "y")])]);
            assert!(client.is_loaded("fs_a"));
            assert_eq!(client.exposed_definitions().len(), 2);
        }
    }

    mod search {
        use super::*;

        fn search_client() -> McpClient {
            client_with_catalog(&[
                (
                    "fs",
                    &[
                        ("read_file", "Read the contents of a file"),
                        ("write_file", "Write contents to a file"),
                        ("list_dir", "List a directory"),
                    ],
                ),
                ("web", &[("fetch", "Fetch a URL and read the response body")]),
            ])
        }

        #[test]
        fn exact_original_name_ranks_first() {
            let client = search_client();
            let results = client.search_tools("read_file", 5);
            assert_eq!(results[0].original_name, "read_file");
        }

        #[test]
        fn respects_limit() {
            let client = search_client();
            let results = client.search_tools("file", 2);
            assert_eq!(results.len(), 2);
        }

        #[test]
        fn non_matching_tools_are_excluded() {
            let client = search_client();
            let results = client.search_tools("zzzz", 10);
            assert!(results.is_empty());
        }

        #[test]
        fn description_terms_match() {
            let client = search_client();
            let results = client.search_tools("directory", 5);
            assert_eq!(results[0].original_name, "list_dir");
        }

        #[test]
        fn ties_keep_insertion_order() {
            let client = client_with_catalog(&[
                ("a", &[("same_tool", "identical description")]),
                ("b", &[("same_tool", "identical description")]),
            ]);
            let results = client.search_tools("same_tool", 5);
            assert_eq!(results[0].server_name, "a");
            assert_eq!(results[1].server_name, "b");
        }

        #[test]
        fn search_emits_result_count() {
            let client = search_client();
            let mut rx = client.events.subscribe();
            client.search_tools("file", 10);
            loop {
                match rx.try_recv() {
                    Ok(Event::McpToolSearch { results, .. }) => {
                        assert!(results >= 2);
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => panic!("no search event emitted"),
                }
            }
        }
    }

    mod transport {
        use super::*;
        use serde_json::json;

        const STUB_OK: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id";;
    *'"tools/list"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo"}]}}\n' "$id";;
    *'"tools/call"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id";;
  esac
done
"#;

        #[tokio::test]
        async fn connect_call_disconnect() {
            let client = McpClient::new();
            client.register_server("fs", ServerConfig::new("sh", &["-c", STUB_OK]));
            client.connect_server("fs").await.unwrap();

            assert_eq!(client.summaries().len(), 1);
            let result = client.call_exposed("fs_echo", json!({"text": "hi"})).await.unwrap();
            assert_eq!(result, json!("pong"));

            // The successful call promoted the tool.
            assert!(client.is_loaded("fs_echo"));

            client.cleanup().await;
            assert!(client.summaries().is_empty());
        }

        const STUB_BAD_PAYLOAD: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id";;
    *'"tools/list"'*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo"}]}}\n' "$id";;
    *'"tools/call"'*) printf '{"jsonrpc":"2.0","id":%s,"result":"not a tool result"}\n' "$id";;
  esac
done
"#;

        #[tokio::test]
        async fn protocol_violation_quarantines_server() {
            let client = McpClient::new();
            client.register_server("bad", ServerConfig::new("sh", &["-c", STUB_BAD_PAYLOAD]));
            client.connect_server("bad").await.unwrap();
            assert_eq!(client.summaries().len(), 1);

            let err = client.call_tool("bad", "echo", json!({})).await.unwrap_err();
            assert!(matches!(err, Error::McpProtocol { .. }), "got: {err:?}");

            // The server's tools are gone; other servers would remain.
            assert!(client.summaries().is_empty());
            client.cleanup().await;
        }

        #[tokio::test]
        async fn dead_letter_records_final_failures() {
            #[derive(Default)]
            struct MemorySink(Mutex<Vec<DeadLetterEntry>>);

            #[async_trait]
            impl DeadLetterSink for MemorySink {
                async fn record(&self, entry: DeadLetterEntry) {
                    if let Ok(mut entries) = self.0.lock() {
                        entries.push(entry);
                    }
                }
            }

            let sink = Arc::new(MemorySink::default());
            let client = McpClient::new()
                .with_dead_letter(Arc::clone(&sink) as Arc<dyn DeadLetterSink>)
                .with_session_id("sess-1");

            // Unregistered server: fails immediately, lands in the sink.
            let err = client.call_tool("ghost", "echo", json!({})).await.unwrap_err();
            assert!(matches!(err, Error::McpServerUnavailable { .. }));

            let entries = sink.0.lock().unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].operation, "mcp:ghost:echo");
            assert_eq!(entries[0].session_id.as_deref(), Some("sess-1"));
        }
    }
}
