//! Ordered message log with token accounting.
//!
//! The context store owns one thread's conversation: an append-only log
//! validated against the tool-call pairing invariants, a chars/4 token
//! estimator, a per-section breakdown for UIs and the MCP lazy loader, and
//! LLM-driven compaction (see [`compaction`]).

pub mod compaction;

pub use compaction::{CompactionConfig, CompactionResult};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::{Message, Role};
use crate::tool::ToolDefinition;

/// Estimate tokens for a string: ceiling of chars / 4.
#[must_use]
pub fn estimate_str_tokens(s: &str) -> u64 {
    (s.chars().count() as u64).div_ceil(4)
}

/// Estimate tokens for a message: content chars / 4 plus serialized
/// tool-call bytes / 4.
#[must_use]
pub fn estimate_message_tokens(message: &Message) -> u64 {
    let mut tokens = (message.content.char_count() as u64).div_ceil(4);
    if let Some(calls) = &message.tool_calls
        && !calls.is_empty()
        && let Ok(serialized) = serde_json::to_string(calls)
    {
        tokens += (serialized.len() as u64).div_ceil(4);
    }
    tokens
}

/// Estimate tokens for a message slice.
#[must_use]
pub fn estimate_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Auxiliary inputs measured by [`ContextStore::breakdown`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BreakdownOptions<'a> {
    /// Tool schemas currently exposed to the model.
    pub tool_schemas: &'a [ToolDefinition],
    /// Project rules text, when configured.
    pub rules: Option<&'a str>,
    /// Agent memory text, when configured.
    pub memory: Option<&'a str>,
    /// MCP tool summaries exposed under lazy loading.
    pub mcp_summaries: Option<&'a str>,
    /// Full MCP tool definitions currently promoted.
    pub mcp_definitions: Option<&'a str>,
}

/// Token estimate per context section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBreakdown {
    /// First system message.
    pub system_prompt: u64,
    /// Tool schema payload.
    pub tool_schemas: u64,
    /// Rules text.
    pub rules: u64,
    /// Memory text.
    pub memory: u64,
    /// Conversation messages (everything but the leading system message).
    pub conversation: u64,
    /// MCP summaries.
    pub mcp_summaries: u64,
    /// Promoted MCP definitions.
    pub mcp_definitions: u64,
}

impl ContextBreakdown {
    /// Sum across all sections.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.system_prompt
            + self.tool_schemas
            + self.rules
            + self.memory
            + self.conversation
            + self.mcp_summaries
            + self.mcp_definitions
    }

    /// Each section as a fraction of the total, in declaration order.
    #[must_use]
    pub fn percentages(&self) -> [f64; 7] {
        let total = self.total().max(1);
        #[allow(clippy::cast_precision_loss)]
        let pct = |v: u64| v as f64 / total as f64;
        [
            pct(self.system_prompt),
            pct(self.tool_schemas),
            pct(self.rules),
            pct(self.memory),
            pct(self.conversation),
            pct(self.mcp_summaries),
            pct(self.mcp_definitions),
        ]
    }
}

/// Ordered, validated message log for one thread.
#[derive(Debug, Clone)]
pub struct ContextStore {
    messages: Vec<Message>,
    compaction: CompactionConfig,
}

impl ContextStore {
    /// Create an empty store with default compaction settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_compaction(CompactionConfig::default())
    }

    /// Create an empty store with custom compaction settings.
    #[must_use]
    pub const fn with_compaction(compaction: CompactionConfig) -> Self {
        Self {
            messages: Vec::new(),
            compaction,
        }
    }

    /// The message log, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages in the log.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Compaction settings.
    #[must_use]
    pub const fn compaction_config(&self) -> &CompactionConfig {
        &self.compaction
    }

    /// Append a message, validating the pairing invariants.
    ///
    /// A tool-role message must carry a `tool_call_id` matching a tool call
    /// on an earlier assistant message that is not already answered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] on a violation.
    pub fn append(&mut self, message: Message) -> Result<()> {
        if message.role == Role::Tool {
            let Some(call_id) = message.tool_call_id.as_deref() else {
                return Err(Error::invalid_request(
                    "tool message is missing tool_call_id",
                ));
            };
            if !self.has_open_tool_call(call_id) {
                return Err(Error::invalid_request(format!(
                    "tool message references unknown tool_call_id '{call_id}'"
                )));
            }
        }
        self.messages.push(message);
        Ok(())
    }

    fn has_open_tool_call(&self, call_id: &str) -> bool {
        let requested = self.messages.iter().any(|m| {
            m.role == Role::Assistant
                && m.tool_calls
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .any(|c| c.id == call_id)
        });
        let answered = self
            .messages
            .iter()
            .any(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some(call_id));
        requested && !answered
    }

    /// Replace the whole log (checkpoint restore). The new log is trusted
    /// to be internally consistent because it was produced by this store.
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Estimated tokens for the whole log.
    #[must_use]
    pub fn estimated_tokens(&self) -> u64 {
        estimate_tokens(&self.messages)
    }

    /// Per-section token breakdown.
    #[must_use]
    pub fn breakdown(&self, options: &BreakdownOptions<'_>) -> ContextBreakdown {
        let (system_prompt, conversation) = match self.messages.first() {
            Some(first) if first.role == Role::System => (
                estimate_message_tokens(first),
                estimate_tokens(&self.messages[1..]),
            ),
            _ => (0, estimate_tokens(&self.messages)),
        };

        let tool_schemas = serde_json::to_string(options.tool_schemas)
            .map(|s| (s.len() as u64).div_ceil(4))
            .unwrap_or(0);

        ContextBreakdown {
            system_prompt,
            tool_schemas,
            rules: options.rules.map_or(0, estimate_str_tokens),
            memory: options.memory.map_or(0, estimate_str_tokens),
            conversation,
            mcp_summaries: options.mcp_summaries.map_or(0, estimate_str_tokens),
            mcp_definitions: options.mcp_definitions.map_or(0, estimate_str_tokens),
        }
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}
