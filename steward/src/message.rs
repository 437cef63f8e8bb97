//! Message types for the conversation log.
//!
//! This module defines the message format exchanged between the scheduler
//! and LLM providers, following chat completion API conventions: an ordered
//! log of role-tagged messages, assistant messages optionally carrying tool
//! calls, and tool-role messages joined back to their originating call by
//! `tool_call_id`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing instructions.
    System,
    /// User message.
    User,
    /// Assistant (model) message.
    Assistant,
    /// Tool result message.
    Tool,
}

impl Role {
    /// Get the string representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// Per-block cache hint passed through to the provider.
///
/// Providers that support prompt caching treat a block marked `ephemeral`
/// as a cache breakpoint; providers that do not simply ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum CacheControl {
    /// Request provider-side prompt caching up to this block.
    Ephemeral,
}

/// One block of structured message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    /// Text content.
    Text {
        /// The text content.
        text: String,
        /// Optional prompt-cache marker.
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    /// Image content (base64 data or URL).
    Image {
        /// The image data or URL.
        image: String,
        /// Optional prompt-cache marker.
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

impl ContentBlock {
    /// Create a text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            cache_control: None,
        }
    }

    /// Create an image block.
    #[must_use]
    pub fn image(image: impl Into<String>) -> Self {
        Self::Image {
            image: image.into(),
            cache_control: None,
        }
    }

    /// Mark this block as a prompt-cache breakpoint.
    #[must_use]
    pub const fn cached(mut self) -> Self {
        match &mut self {
            Self::Text { cache_control, .. } | Self::Image { cache_control, .. } => {
                *cache_control = Some(CacheControl::Ephemeral);
            }
        }
        self
    }

    /// Get the text if this is a text block.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } => Some(text),
            Self::Image { .. } => None,
        }
    }
}

/// Message content: either a plain string or an ordered block sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    /// Plain text content.
    Text(String),
    /// Structured content blocks.
    Blocks(Vec<ContentBlock>),
}

impl Content {
    /// Render the content as a single string (blocks joined by newlines).
    #[must_use]
    pub fn as_string(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(ContentBlock::as_text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Total character count across all text content.
    #[must_use]
    pub fn char_count(&self) -> usize {
        match self {
            Self::Text(s) => s.chars().count(),
            Self::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text, .. } => text.chars().count(),
                    ContentBlock::Image { image, .. } => image.chars().count(),
                })
                .sum(),
        }
    }

    /// Whether there is no content at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Blocks(blocks) => blocks.is_empty(),
        }
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// A tool call requested by the model.
///
/// `id` is opaque but stable within an iteration; it is the join key to the
/// subsequent tool-role [`Message`] whose `tool_call_id` matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for the tool call.
    pub id: String,
    /// Name of the tool to call.
    pub name: String,
    /// Arguments to pass to the tool.
    pub arguments: Value,
    /// Set when the provider returned arguments that failed to parse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl ToolCall {
    /// Create a new tool call.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            parse_error: None,
        }
    }

    /// Canonical `(tool, args)` key used for loop-detection equivalence.
    #[must_use]
    pub fn stable_key(&self) -> String {
        format!("{}:{}", self.name, canonical_json(&self.arguments))
    }
}

/// A message in the conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender.
    pub role: Role,
    /// Content of the message.
    pub content: Content,
    /// Tool calls made by the model (assistant messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Tool call id this message answers (tool messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Arbitrary metadata attached by the runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
}

impl Message {
    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<Content>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            metadata: None,
        }
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<Content>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            metadata: None,
        }
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<Content>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            metadata: None,
        }
    }

    /// Create an assistant message carrying tool calls.
    #[must_use]
    pub fn assistant_with_tool_calls(
        content: impl Into<Content>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            metadata: None,
        }
    }

    /// Create a tool result message answering `tool_call_id`.
    #[must_use]
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<Content>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            metadata: None,
        }
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }

    /// The message text (blocks joined by newlines).
    #[must_use]
    pub fn text(&self) -> String {
        self.content.as_string()
    }

    /// Whether this message carries at least one tool call.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Names of the tools this message calls.
    #[must_use]
    pub fn tool_names(&self) -> Vec<&str> {
        self.tool_calls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// Canonical JSON encoding: object keys sorted, no whitespace.
///
/// Tool-call equivalence for doom-loop detection must not depend on the
/// provider's argument key ordering, so the ring buffer stores this form.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, &Value> = map.iter().collect();
                out.push('{');
                for (i, (key, val)) in sorted.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String((*key).clone()).to_string());
                    out.push(':');
                    write(val, out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    mod roles {
        use super::*;

        #[test]
        fn as_str_matches_serde() {
            for role in [Role::System, Role::User, Role::Assistant, Role::Tool] {
                let json = serde_json::to_string(&role).unwrap();
                assert_eq!(json, format!("\"{}\"", role.as_str()));
            }
        }
    }

    mod content {
        use super::*;

        #[test]
        fn text_roundtrip() {
            let content = Content::Text("hello".into());
            let json = serde_json::to_string(&content).unwrap();
            assert_eq!(json, "\"hello\"");
            let parsed: Content = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, content);
        }

        #[test]
        fn blocks_join_with_newlines() {
            let content = Content::Blocks(vec![
                ContentBlock::text("one"),
                ContentBlock::image("data:..."),
                ContentBlock::text("two"),
            ]);
            assert_eq!(content.as_string(), "one\ntwo");
        }

        #[test]
        fn cached_marks_ephemeral() {
            let block = ContentBlock::text("sys").cached();
            let json = serde_json::to_value(&block).unwrap();
            assert_eq!(json["cache_control"]["type"], "ephemeral");
        }

        #[test]
        fn char_count_spans_blocks() {
            let content = Content::Blocks(vec![ContentBlock::text("ab"), ContentBlock::text("cd")]);
            assert_eq!(content.char_count(), 4);
        }
    }

    mod tool_calls {
        use super::*;

        #[test]
        fn stable_key_ignores_key_order() {
            let a = ToolCall::new("1", "bash", json!({"cmd": "ls", "cwd": "/tmp"}));
            let b = ToolCall::new("2", "bash", json!({"cwd": "/tmp", "cmd": "ls"}));
            assert_eq!(a.stable_key(), b.stable_key());
        }

        #[test]
        fn stable_key_distinguishes_args() {
            let a = ToolCall::new("1", "bash", json!({"cmd": "ls"}));
            let b = ToolCall::new("1", "bash", json!({"cmd": "pwd"}));
            assert_ne!(a.stable_key(), b.stable_key());
        }

        #[test]
        fn parse_error_skipped_when_none() {
            let call = ToolCall::new("1", "bash", json!({}));
            let json = serde_json::to_string(&call).unwrap();
            assert!(!json.contains("parse_error"));
        }
    }

    mod messages {
        use super::*;

        #[test]
        fn constructors_set_roles() {
            assert_eq!(Message::system("s").role, Role::System);
            assert_eq!(Message::user("u").role, Role::User);
            assert_eq!(Message::assistant("a").role, Role::Assistant);
            assert_eq!(Message::tool("id", "r").role, Role::Tool);
        }

        #[test]
        fn tool_message_carries_call_id() {
            let msg = Message::tool("call_7", "output");
            assert_eq!(msg.tool_call_id.as_deref(), Some("call_7"));
        }

        #[test]
        fn has_tool_calls_ignores_empty_vec() {
            let msg = Message::assistant_with_tool_calls("", vec![]);
            assert!(!msg.has_tool_calls());

            let msg = Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("1", "read_file", json!({"path": "x"}))],
            );
            assert!(msg.has_tool_calls());
            assert_eq!(msg.tool_names(), vec!["read_file"]);
        }

        #[test]
        fn metadata_roundtrip() {
            let msg = Message::user("hi").with_metadata("source", json!("repl"));
            let json = serde_json::to_string(&msg).unwrap();
            let parsed: Message = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed.metadata.unwrap()["source"], json!("repl"));
        }
    }

    mod canonical {
        use super::*;

        #[test]
        fn sorts_keys_recursively() {
            let value = json!({"b": 1, "a": {"z": true, "y": [3, 2]}});
            assert_eq!(canonical_json(&value), r#"{"a":{"y":[3,2],"z":true},"b":1}"#);
        }

        #[test]
        fn no_whitespace() {
            let value = json!({"k": [1, 2, 3]});
            assert!(!canonical_json(&value).contains(' '));
        }

        #[test]
        fn escapes_strings() {
            let value = json!({"msg": "a\"b"});
            assert_eq!(canonical_json(&value), r#"{"msg":"a\"b"}"#);
        }
    }
}
