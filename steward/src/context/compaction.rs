//! LLM-driven context compaction.
//!
//! When the estimated token count crosses a threshold, the store replaces
//! everything but the leading system message and a recent tail with a
//! single synthetic summary message. The split never separates an
//! assistant tool-call message from its tool-role replies, and a provider
//! failure falls back to a deterministic extraction rather than losing the
//! conversation.

use tracing::{debug, warn};

use crate::context::{ContextStore, estimate_tokens};
use crate::error::Result;
use crate::llm::{ChatRequest, LlmProvider};
use crate::message::{Message, Role};
use crate::prompts;

/// Characters of a single message rendered into the summarization request
/// before truncation.
const RENDER_CHAR_CAP: usize = 2000;

/// User-request previews kept by the deterministic fallback.
const FALLBACK_PREVIEWS: usize = 5;

/// Characters per preview in the deterministic fallback.
const FALLBACK_PREVIEW_CHARS: usize = 100;

/// Compaction settings.
#[derive(Debug, Clone, Copy)]
pub struct CompactionConfig {
    /// Messages preserved verbatim at the tail.
    pub preserve_recent_count: usize,
    /// Response cap for the summarization call.
    pub summary_max_tokens: u32,
    /// Token estimate at which automatic compaction runs.
    pub threshold: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            preserve_recent_count: 10,
            summary_max_tokens: 2000,
            threshold: 80_000,
        }
    }
}

/// Outcome of one compaction attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    /// Whether anything was compacted.
    pub compacted: bool,
    /// Message count before.
    pub messages_before: usize,
    /// Message count after.
    pub messages_after: usize,
    /// Estimated tokens before.
    pub tokens_before: u64,
    /// Estimated tokens after.
    pub tokens_after: u64,
    /// The deterministic fallback was used because the provider failed.
    pub used_fallback: bool,
}

impl CompactionResult {
    fn noop(messages: usize, tokens: u64) -> Self {
        Self {
            compacted: false,
            messages_before: messages,
            messages_after: messages,
            tokens_before: tokens,
            tokens_after: tokens,
            used_fallback: false,
        }
    }
}

impl ContextStore {
    /// Compact the log if its estimate has reached the configured threshold.
    ///
    /// # Errors
    ///
    /// Never fails on provider errors (those trigger the deterministic
    /// fallback); propagates nothing else today but is fallible so the
    /// store can surface invariant violations.
    pub async fn compact_if_needed(
        &mut self,
        provider: &dyn LlmProvider,
        model: &str,
    ) -> Result<CompactionResult> {
        let tokens = self.estimated_tokens();
        if tokens < self.compaction_config().threshold {
            return Ok(CompactionResult::noop(self.len(), tokens));
        }
        self.compact(provider, model).await
    }

    /// Compact the log unconditionally (used for emergency compaction when
    /// the provider reports the context no longer fits).
    pub async fn compact(
        &mut self,
        provider: &dyn LlmProvider,
        model: &str,
    ) -> Result<CompactionResult> {
        let tokens_before = self.estimated_tokens();
        let messages_before = self.len();
        let config = *self.compaction_config();

        // 1. The leading system message survives verbatim.
        let has_system = self
            .messages()
            .first()
            .is_some_and(|m| m.role == Role::System);
        let conversation_start = usize::from(has_system);
        let conversation = &self.messages()[conversation_start..];

        // 2. Split: the last `preserve_recent_count` form the tail.
        if conversation.len() <= config.preserve_recent_count {
            return Ok(CompactionResult::noop(messages_before, tokens_before));
        }
        let mut split = conversation.len() - config.preserve_recent_count;

        // A tail that opens with a tool-role message would orphan it from
        // its assistant tool_call; widen until the pair stays together.
        while split > 0 && conversation[split].role == Role::Tool {
            split -= 1;
        }

        // 3. Empty compact set is a no-op.
        if split == 0 {
            return Ok(CompactionResult::noop(messages_before, tokens_before));
        }

        let compact_set = &conversation[..split];
        let tail: Vec<Message> = conversation[split..].to_vec();

        // 4–5. Summarize through the provider, falling back deterministically.
        let rendered = render_for_summary(compact_set);
        let request = ChatRequest::new(
            model,
            vec![
                Message::system(prompts::SUMMARIZATION_PROMPT),
                Message::user(rendered),
            ],
        )
        .max_tokens(config.summary_max_tokens);

        let (summary, used_fallback) = match provider.chat(&request).await {
            Ok(response) => (response.text(), false),
            Err(err) => {
                warn!(error = %err, "summarization call failed; using deterministic fallback");
                (fallback_summary(compact_set), true)
            }
        };

        // 6. Rebuild: [system?, summary, ...tail].
        let summary_message = Message::system(format!(
            "{} {} earlier messages]\n{summary}",
            prompts::SUMMARY_PREFIX,
            compact_set.len(),
        ));

        let mut rebuilt = Vec::with_capacity(tail.len() + 2);
        if has_system {
            rebuilt.push(self.messages()[0].clone());
        }
        rebuilt.push(summary_message);
        rebuilt.extend(tail);
        self.replace(rebuilt);

        let tokens_after = self.estimated_tokens();
        debug!(
            messages_before,
            messages_after = self.len(),
            tokens_before,
            tokens_after,
            used_fallback,
            "context compacted",
        );

        Ok(CompactionResult {
            compacted: true,
            messages_before,
            messages_after: self.len(),
            tokens_before,
            tokens_after,
            used_fallback,
        })
    }
}

/// Render the compact set as role-tagged plain text for the summarizer.
fn render_for_summary(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        let mut text = message.text();
        if text.chars().count() > RENDER_CHAR_CAP {
            text = text.chars().take(RENDER_CHAR_CAP).collect();
            text.push_str("… [truncated]");
        }
        out.push_str(message.role.as_str());
        out.push_str(": ");
        out.push_str(&text);
        if message.has_tool_calls() {
            out.push_str(&format!(" [Used tools: {}]", message.tool_names().join(", ")));
        }
        out.push('\n');
    }
    out
}

/// Deterministic extraction used when the summarization call fails.
fn fallback_summary(messages: &[Message]) -> String {
    let mut previews = Vec::new();
    for message in messages.iter().filter(|m| m.role == Role::User) {
        if previews.len() >= FALLBACK_PREVIEWS {
            break;
        }
        let text: String = message.text().chars().take(FALLBACK_PREVIEW_CHARS).collect();
        if !text.is_empty() {
            previews.push(format!("- {text}"));
        }
    }

    let mut tools: Vec<String> = Vec::new();
    for message in messages {
        for name in message.tool_names() {
            if !tools.iter().any(|t| t == name) {
                tools.push(name.to_owned());
            }
        }
    }

    let mut out = String::from("User requests:\n");
    out.push_str(&previews.join("\n"));
    if !tools.is_empty() {
        out.push_str(&format!("\nTools used: {}", tools.join(", ")));
    }
    out
}
