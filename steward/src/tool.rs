//! Tool definitions and the execution trait.
//!
//! Tools are the runtime's only side-effecting surface. Each tool carries a
//! JSON-Schema parameter description for the model and a danger level the
//! policy engine and approval gate consult before dispatch.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// How risky a tool is to run without oversight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DangerLevel {
    /// Read-only or otherwise harmless.
    #[default]
    Safe,
    /// Mutates local state (files, processes).
    Moderate,
    /// Destructive or externally visible effects.
    Dangerous,
}

impl fmt::Display for DangerLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Safe => "safe",
            Self::Moderate => "moderate",
            Self::Dangerous => "dangerous",
        };
        f.write_str(s)
    }
}

/// Definition of a tool for LLM function calling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name, snake_case.
    pub name: String,
    /// What the tool does; the model uses this to decide when to call it.
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameters: Value,
    /// Risk classification consulted by policy and approval.
    #[serde(default)]
    pub danger: DangerLevel,
}

impl ToolDefinition {
    /// Create a new tool definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            danger: DangerLevel::Safe,
        }
    }

    /// Set the danger level.
    #[must_use]
    pub const fn with_danger(mut self, danger: DangerLevel) -> Self {
        self.danger = danger;
        self
    }

    /// Derive the parameter schema from a Rust type.
    ///
    /// The type must derive [`schemars::JsonSchema`]. The `$schema` meta
    /// field is stripped because LLM APIs do not want it.
    #[must_use]
    pub fn from_type<T: schemars::JsonSchema>(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let root = schemars::schema_for!(T);
        let mut schema = serde_json::to_value(&root).unwrap_or_default();
        if let Value::Object(map) = &mut schema {
            map.remove("$schema");
        }
        Self::new(name, description, schema)
    }

    /// Returns the tool name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Object-safe execution trait for tools.
///
/// Built-in tools implement this directly; MCP tools are synthesized from a
/// server's advertised catalog and proxy through the transport.
#[async_trait]
pub trait DynTool: Send + Sync {
    /// The tool's definition (name, description, schema, danger).
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with JSON arguments.
    async fn execute(&self, args: Value) -> Result<Value>;
}

/// Shared handle to a tool.
pub type SharedTool = Arc<dyn DynTool>;

type ToolFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
type ToolFn = dyn Fn(Value) -> ToolFuture + Send + Sync;

/// A tool backed by a closure.
///
/// The cheapest way to register a built-in; production filesystem tools and
/// the test suite both use this.
pub struct FnTool {
    definition: ToolDefinition,
    handler: Box<ToolFn>,
}

impl FnTool {
    /// Create a tool from a definition and an async closure.
    pub fn new<F, Fut>(definition: ToolDefinition, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            definition,
            handler: Box::new(move |args| Box::pin(handler(args))),
        }
    }

    /// Create a tool from a synchronous closure.
    pub fn sync<F>(definition: ToolDefinition, handler: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            definition,
            handler: Box::new(move |args| {
                let result = handler(args);
                Box::pin(async move { result })
            }),
        }
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.definition.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DynTool for FnTool {
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        (self.handler)(args).await
    }
}

/// Parse typed arguments out of a JSON value, tolerating the
/// string-encoded-JSON form some providers emit.
///
/// # Errors
///
/// Returns [`Error::ToolExecution`] when the arguments do not match `T`.
pub fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, args: &Value) -> Result<T> {
    let parsed = match args {
        Value::String(s) => serde_json::from_str(s),
        other => serde_json::from_value(other.clone()),
    };
    parsed.map_err(|e| Error::tool(tool, format!("invalid arguments: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    mod definitions {
        use super::*;

        #[test]
        fn default_danger_is_safe() {
            let def = ToolDefinition::new("read_file", "Read a file", json!({"type": "object"}));
            assert_eq!(def.danger, DangerLevel::Safe);
        }

        #[test]
        fn danger_levels_are_ordered() {
            assert!(DangerLevel::Safe < DangerLevel::Moderate);
            assert!(DangerLevel::Moderate < DangerLevel::Dangerous);
        }

        #[test]
        fn from_type_strips_meta_schema() {
            #[derive(schemars::JsonSchema)]
            #[allow(dead_code)]
            struct Args {
                path: String,
            }

            let def = ToolDefinition::from_type::<Args>("read_file", "Read a file");
            assert!(def.parameters.get("$schema").is_none());
            assert!(def.parameters["properties"]["path"].is_object());
        }

        #[test]
        fn serde_roundtrip() {
            let def = ToolDefinition::new("bash", "Run a command", json!({"type": "object"}))
                .with_danger(DangerLevel::Dangerous);
            let json = serde_json::to_string(&def).unwrap();
            let parsed: ToolDefinition = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, def);
        }
    }

    mod fn_tools {
        use super::*;

        #[tokio::test]
        async fn async_closure_executes() {
            let tool = FnTool::new(
                ToolDefinition::new("echo", "Echo args", json!({"type": "object"})),
                |args| async move { Ok(args) },
            );
            let out = tool.execute(json!({"x": 1})).await.unwrap();
            assert_eq!(out, json!({"x": 1}));
        }

        #[tokio::test]
        async fn sync_closure_executes() {
            let tool = FnTool::sync(
                ToolDefinition::new("fail", "Always fails", json!({"type": "object"})),
                |_| Err(Error::tool("fail", "nope")),
            );
            let err = tool.execute(json!({})).await.unwrap_err();
            assert!(err.surfaces_to_model());
        }
    }

    mod args {
        use super::*;

        #[derive(Debug, Deserialize)]
        struct Cmd {
            command: String,
        }

        #[test]
        fn parses_object_form() {
            let args = json!({"command": "ls"});
            let cmd: Cmd = parse_args("bash", &args).unwrap();
            assert_eq!(cmd.command, "ls");
        }

        #[test]
        fn parses_string_encoded_form() {
            let args = Value::String(r#"{"command": "ls"}"#.into());
            let cmd: Cmd = parse_args("bash", &args).unwrap();
            assert_eq!(cmd.command, "ls");
        }

        #[test]
        fn mismatch_is_tool_error() {
            let err = parse_args::<Cmd>("bash", &json!({"cmd": "ls"})).unwrap_err();
            assert!(matches!(err, Error::ToolExecution { .. }));
        }
    }
}
