//! Chat types and the provider trait for LLM operations.
//!
//! This module defines the interface the scheduler consumes:
//! - [`ChatRequest`]: request parameters for one completion
//! - [`ChatResponse`]: the provider's reply, with usage accounting
//! - [`LlmProvider`]: the trait every backend adapter implements
//!
//! Adapters own retries, backoff, rate-limit header parsing, and circuit
//! breaking; the scheduler consumes the result opaquely. Cancellation is
//! cooperative: the scheduler drops the in-flight `chat` future, which
//! aborts the underlying request.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::message::Message;
use crate::tool::ToolDefinition;

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of turn.
    Stop,
    /// Output token limit reached.
    Length,
    /// The model is requesting tool calls.
    ToolUse,
    /// Provider content filter intervened.
    ContentFilter,
    /// Provider-specific reason.
    Other(String),
}

impl StopReason {
    /// Whether the model completed its turn normally.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Stop | Self::ToolUse)
    }
}

/// Controls how the model may use tools.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ToolChoice {
    /// Model decides whether to use tools.
    #[default]
    Auto,
    /// Model must use at least one tool.
    Required,
    /// Model cannot use any tools.
    None,
    /// Model must call the named function.
    Function(String),
}

impl ToolChoice {
    /// Convert to the wire value adapters serialize.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Auto => Value::String("auto".to_owned()),
            Self::Required => Value::String("required".to_owned()),
            Self::None => Value::String("none".to_owned()),
            Self::Function(name) => serde_json::json!({
                "type": "function",
                "function": {"name": name}
            }),
        }
    }
}

/// A chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Model identifier.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<Message>,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Stop sequences.
    pub stop_sequences: Option<Vec<String>>,
    /// Tool schemas the model may call.
    pub tools: Option<Vec<ToolDefinition>>,
    /// Tool-use mode.
    pub tool_choice: Option<ToolChoice>,
}

impl ChatRequest {
    /// Create a request for `model` over `messages`.
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    /// Set the generation token cap.
    #[must_use]
    pub const fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the sampling temperature.
    #[must_use]
    pub const fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set stop sequences.
    #[must_use]
    pub fn stop_sequences(mut self, stop: Vec<String>) -> Self {
        self.stop_sequences = Some(stop);
        self
    }

    /// Set the tool schemas.
    #[must_use]
    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Set the tool-use mode.
    #[must_use]
    pub fn tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }
}

/// Token and cost accounting returned by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmUsage {
    /// Tokens in the prompt.
    pub input_tokens: u64,
    /// Tokens generated.
    pub output_tokens: u64,
    /// Tokens served from the provider's prompt cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
    /// Authoritative cost reported by the provider, when available.
    /// When absent the budget computes cost from the pricing table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl LlmUsage {
    /// Create a usage record from token counts.
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cached_tokens: None,
            cost: None,
        }
    }

    /// Attach an authoritative provider cost.
    #[must_use]
    pub const fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// A chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// The generated assistant message (content plus any tool calls).
    pub message: Message,
    /// Why the model stopped.
    pub stop_reason: StopReason,
    /// Token and cost accounting.
    pub usage: Option<LlmUsage>,
    /// Model that produced the response.
    pub model: Option<String>,
    /// Extended-thinking text, when the provider returns it.
    pub thinking: Option<String>,
}

impl ChatResponse {
    /// Create a response from an assistant message.
    #[must_use]
    pub const fn new(message: Message) -> Self {
        Self {
            message,
            stop_reason: StopReason::Stop,
            usage: None,
            model: None,
            thinking: None,
        }
    }

    /// Create a plain-text response.
    #[must_use]
    pub fn from_text(content: impl Into<String>) -> Self {
        Self::new(Message::assistant(content.into()))
    }

    /// Set the stop reason.
    #[must_use]
    pub fn with_stop_reason(mut self, reason: StopReason) -> Self {
        self.stop_reason = reason;
        self
    }

    /// Set usage accounting.
    #[must_use]
    pub const fn with_usage(mut self, usage: LlmUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// The text content of the response.
    #[must_use]
    pub fn text(&self) -> String {
        self.message.text()
    }

    /// Tool calls requested by the model, if any.
    #[must_use]
    pub fn tool_calls(&self) -> &[crate::message::ToolCall] {
        self.message.tool_calls.as_deref().unwrap_or_default()
    }
}

/// Trait for LLM backend adapters.
///
/// Implementations are responsible for transport concerns (HTTP retries,
/// exponential backoff, `Retry-After` parsing); errors that survive the
/// adapter's own retry loop are returned using the crate error taxonomy so
/// the scheduler can classify them.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and await the full response.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Adapter name, used in logs and error messages.
    fn name(&self) -> &'static str;

    /// The model used when a request does not name one.
    fn default_model(&self) -> &str;
}

/// Type alias for a shared provider handle.
pub type SharedProvider = std::sync::Arc<dyn LlmProvider>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    mod requests {
        use super::*;

        #[test]
        fn builder_chain() {
            let req = ChatRequest::new("sonnet-4", vec![Message::user("hi")])
                .max_tokens(1024)
                .temperature(0.2)
                .tool_choice(ToolChoice::None);

            assert_eq!(req.model, "sonnet-4");
            assert_eq!(req.messages.len(), 1);
            assert_eq!(req.max_tokens, Some(1024));
            assert_eq!(req.tool_choice, Some(ToolChoice::None));
        }

        #[test]
        fn default_is_empty() {
            let req = ChatRequest::default();
            assert!(req.model.is_empty());
            assert!(req.tools.is_none());
        }
    }

    mod tool_choice {
        use super::*;

        #[test]
        fn scalar_modes_serialize_to_strings() {
            assert_eq!(ToolChoice::Auto.to_value(), "auto");
            assert_eq!(ToolChoice::Required.to_value(), "required");
            assert_eq!(ToolChoice::None.to_value(), "none");
        }

        #[test]
        fn function_mode_names_the_function() {
            let val = ToolChoice::Function("read_file".into()).to_value();
            assert_eq!(val["function"]["name"], "read_file");
        }
    }

    mod responses {
        use super::*;
        use serde_json::json;

        #[test]
        fn from_text_is_assistant() {
            let resp = ChatResponse::from_text("done");
            assert_eq!(resp.message.role.as_str(), "assistant");
            assert_eq!(resp.text(), "done");
            assert!(resp.tool_calls().is_empty());
        }

        #[test]
        fn tool_calls_exposed() {
            let msg = Message::assistant_with_tool_calls(
                "",
                vec![crate::message::ToolCall::new("1", "bash", json!({"cmd": "ls"}))],
            );
            let resp = ChatResponse::new(msg).with_stop_reason(StopReason::ToolUse);
            assert_eq!(resp.tool_calls().len(), 1);
            assert!(resp.stop_reason.is_complete());
        }

        #[test]
        fn usage_cost_is_optional() {
            let usage = LlmUsage::new(70, 15);
            assert!(usage.cost.is_none());
            let usage = usage.with_cost(0.0123);
            assert_eq!(usage.cost, Some(0.0123));
        }
    }
}
