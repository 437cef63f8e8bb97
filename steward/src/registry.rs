//! Unified tool dispatch.
//!
//! The registry is the single surface the scheduler calls tools through.
//! Resolution order: explicitly registered built-ins, then the resolver
//! callback, then MCP tools (promoted implicitly on execution). Tool
//! failures are captured in the outcome, never propagated — the model
//! observes them as text.

use std::sync::Arc;

use serde_json::Value;

use crate::mcp::McpClient;
use crate::tool::{DangerLevel, SharedTool, ToolDefinition};

/// The name of the MCP search meta-tool.
pub const MCP_SEARCH_TOOL: &str = "mcp_tool_search";

/// Result of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteOutcome {
    /// Whether the tool ran without error.
    pub success: bool,
    /// Tool output, or the error text on failure.
    pub output: Value,
}

impl ExecuteOutcome {
    /// A successful outcome.
    #[must_use]
    pub const fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
        }
    }

    /// A failed outcome carrying the error text.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::String(message.into()),
        }
    }

    /// Output rendered as a string for the tool-role message.
    #[must_use]
    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

type Resolver = Box<dyn Fn(&str) -> Option<SharedTool> + Send + Sync>;

/// Composes built-in tools, a resolver callback, and MCP tools behind one
/// call interface.
pub struct ToolRegistry {
    builtins: Vec<SharedTool>,
    resolver: Option<Resolver>,
    mcp: Option<Arc<McpClient>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("builtins", &self.builtins.len())
            .field("has_resolver", &self.resolver.is_some())
            .field("has_mcp", &self.mcp.is_some())
            .finish()
    }
}

impl ToolRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            builtins: Vec::new(),
            resolver: None,
            mcp: None,
        }
    }

    /// Register a built-in tool. Built-ins win over every other source.
    pub fn register(&mut self, tool: SharedTool) {
        self.builtins.push(tool);
    }

    /// Attach a lazy resolver callback consulted after built-ins.
    #[must_use]
    pub fn with_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str) -> Option<SharedTool> + Send + Sync + 'static,
    {
        self.resolver = Some(Box::new(resolver));
        self
    }

    /// Attach the MCP client, consulted last.
    #[must_use]
    pub fn with_mcp(mut self, mcp: Arc<McpClient>) -> Self {
        self.mcp = Some(mcp);
        self
    }

    /// Tool schemas to hand the model: built-ins, the MCP catalog per its
    /// lazy state, and the search meta-tool when MCP is attached.
    #[must_use]
    pub fn descriptions(&self) -> Vec<ToolDefinition> {
        let mut out: Vec<ToolDefinition> =
            self.builtins.iter().map(|t| t.definition()).collect();
        if let Some(mcp) = &self.mcp {
            out.extend(mcp.exposed_definitions());
            out.push(search_tool_definition());
        }
        out
    }

    /// The definition for one tool name, from any source.
    #[must_use]
    pub fn definition(&self, name: &str) -> Option<ToolDefinition> {
        if let Some(tool) = self.builtins.iter().find(|t| t.definition().name == name) {
            return Some(tool.definition());
        }
        if let Some(resolver) = &self.resolver
            && let Some(tool) = resolver(name)
        {
            return Some(tool.definition());
        }
        if let Some(mcp) = &self.mcp {
            if name == MCP_SEARCH_TOOL {
                return Some(search_tool_definition());
            }
            return mcp.full_definition(name);
        }
        None
    }

    /// Summaries text for context accounting under lazy loading.
    #[must_use]
    pub fn mcp_summaries_text(&self) -> Option<String> {
        let mcp = self.mcp.as_ref()?;
        let summaries = mcp.summaries();
        if summaries.is_empty() {
            return None;
        }
        let lines: Vec<String> = summaries
            .iter()
            .map(|s| format!("{}: {}", s.name, s.description))
            .collect();
        Some(lines.join("\n"))
    }

    /// Execute a tool by name.
    ///
    /// Executing a summary-only MCP tool implicitly promotes it before
    /// dispatch. Unknown names and tool failures both come back as a
    /// failed outcome, never an `Err`.
    pub async fn execute(&self, name: &str, args: Value) -> ExecuteOutcome {
        // 1. Built-ins.
        if let Some(tool) = self.builtins.iter().find(|t| t.definition().name == name) {
            return match tool.execute(args).await {
                Ok(output) => ExecuteOutcome::ok(output),
                Err(err) => ExecuteOutcome::error(err.to_string()),
            };
        }

        // 2. Resolver callback.
        if let Some(resolver) = &self.resolver
            && let Some(tool) = resolver(name)
        {
            return match tool.execute(args).await {
                Ok(output) => ExecuteOutcome::ok(output),
                Err(err) => ExecuteOutcome::error(err.to_string()),
            };
        }

        // 3. MCP: the search meta-tool, then promoted dispatch.
        if let Some(mcp) = &self.mcp {
            if name == MCP_SEARCH_TOOL {
                return self.run_search(mcp, &args);
            }
            if mcp.split_exposed(name).is_some() {
                return match mcp.call_exposed(name, args).await {
                    Ok(output) => ExecuteOutcome::ok(output),
                    Err(err) => ExecuteOutcome::error(err.to_string()),
                };
            }
        }

        ExecuteOutcome::error(format!("Tool '{name}' not found"))
    }

    fn run_search(&self, mcp: &McpClient, args: &Value) -> ExecuteOutcome {
        let query = args.get("query").and_then(Value::as_str).unwrap_or_default();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(5) as usize;

        let results = mcp.search_tools(query, limit);
        // Tools surfaced by search are promoted so their full schemas are
        // available on the next LLM call.
        for summary in &results {
            mcp.promote(&summary.name);
        }
        match serde_json::to_value(&results) {
            Ok(value) => ExecuteOutcome::ok(value),
            Err(err) => ExecuteOutcome::error(err.to_string()),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn search_tool_definition() -> ToolDefinition {
    ToolDefinition::new(
        MCP_SEARCH_TOOL,
        "Search available MCP tools by name or description. Returns matching tool summaries \
and loads their full schemas for subsequent calls.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search terms"},
                "limit": {"type": "integer", "description": "Maximum results", "default": 5}
            },
            "required": ["query"]
        }),
    )
    .with_danger(DangerLevel::Safe)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::tool::FnTool;
    use serde_json::json;

    fn echo_tool(name: &str) -> SharedTool {
        Arc::new(FnTool::new(
            ToolDefinition::new(name, "Echo args back", json!({"type": "object"})),
            |args| async move { Ok(args) },
        ))
    }

    #[tokio::test]
    async fn builtin_dispatch() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool("echo"));

        let outcome = registry.execute("echo", json!({"x": 1})).await;
        assert!(outcome.success);
        assert_eq!(outcome.output, json!({"x": 1}));
    }

    #[tokio::test]
    async fn builtin_failure_is_captured() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FnTool::sync(
            ToolDefinition::new("fail", "Always fails", json!({"type": "object"})),
            |_| Err(Error::tool("fail", "broken")),
        )));

        let outcome = registry.execute("fail", json!({})).await;
        assert!(!outcome.success);
        assert!(outcome.output_text().contains("broken"));
    }

    #[tokio::test]
    async fn unknown_tool_fails_without_error() {
        let registry = ToolRegistry::new();
        let outcome = registry.execute("missing", json!({})).await;
        assert!(!outcome.success);
        assert!(outcome.output_text().contains("not found"));
    }

    #[tokio::test]
    async fn resolver_consulted_after_builtins() {
        let mut registry = ToolRegistry::new().with_resolver(|name| {
            (name == "dynamic").then(|| echo_tool("dynamic"))
        });
        registry.register(echo_tool("static"));

        assert!(registry.execute("static", json!({})).await.success);
        assert!(registry.execute("dynamic", json!({})).await.success);
        assert!(!registry.execute("other", json!({})).await.success);
    }

    #[tokio::test]
    async fn builtin_shadows_resolver() {
        let mut registry = ToolRegistry::new().with_resolver(|_| {
            Some(Arc::new(FnTool::sync(
                ToolDefinition::new("echo", "resolver version", json!({})),
                |_| Ok(json!("from resolver")),
            )) as SharedTool)
        });
        registry.register(Arc::new(FnTool::sync(
            ToolDefinition::new("echo", "builtin version", json!({})),
            |_| Ok(json!("from builtin")),
        )));

        let outcome = registry.execute("echo", json!({})).await;
        assert_eq!(outcome.output, json!("from builtin"));
    }

    #[test]
    fn descriptions_include_builtins() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool("echo"));
        let names: Vec<String> = registry.descriptions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["echo"]);
    }

    #[test]
    fn mcp_attaches_search_meta_tool() {
        let registry = ToolRegistry::new().with_mcp(Arc::new(McpClient::new()));
        let names: Vec<String> = registry.descriptions().into_iter().map(|d| d.name).collect();
        assert!(names.contains(&MCP_SEARCH_TOOL.to_owned()));
        assert!(registry.definition(MCP_SEARCH_TOOL).is_some());
    }
}
