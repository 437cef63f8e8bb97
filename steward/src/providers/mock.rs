//! Mock provider for testing.
//!
//! Returns scripted turns in sequence, repeating the final turn once the
//! script is exhausted. Records every request it receives so tests can
//! assert on injected prompts and tool schemas.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::llm::{ChatRequest, ChatResponse, LlmProvider, LlmUsage, StopReason};
use crate::message::{Message, ToolCall};

/// One scripted turn.
#[derive(Debug, Clone)]
pub struct MockTurn {
    response: std::result::Result<ChatResponse, Error>,
}

impl MockTurn {
    /// A plain-text assistant turn.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            response: Ok(ChatResponse::from_text(content).with_usage(LlmUsage::new(10, 5))),
        }
    }

    /// A turn requesting a single tool call.
    #[must_use]
    pub fn tool_call(name: impl Into<String>, arguments: Value) -> Self {
        Self::tool_calls(vec![(name.into(), arguments)])
    }

    /// A turn requesting several tool calls.
    #[must_use]
    pub fn tool_calls(calls: Vec<(String, Value)>) -> Self {
        let tool_calls: Vec<ToolCall> = calls
            .into_iter()
            .enumerate()
            .map(|(i, (name, args))| ToolCall::new(format!("call_{i}"), name, args))
            .collect();
        let message = Message::assistant_with_tool_calls("", tool_calls);
        Self {
            response: Ok(ChatResponse::new(message)
                .with_stop_reason(StopReason::ToolUse)
                .with_usage(LlmUsage::new(10, 5))),
        }
    }

    /// A turn that fails with `error`.
    #[must_use]
    pub const fn failure(error: Error) -> Self {
        Self {
            response: Err(error),
        }
    }

    /// Override the usage this turn reports.
    #[must_use]
    pub fn with_usage(mut self, usage: LlmUsage) -> Self {
        if let Ok(resp) = &mut self.response {
            resp.usage = Some(usage);
        }
        self
    }

    /// Use a fully custom response.
    #[must_use]
    pub const fn response(response: ChatResponse) -> Self {
        Self {
            response: Ok(response),
        }
    }
}

/// A scripted mock provider.
///
/// # Example
///
/// ```rust,ignore
/// let provider = MockProvider::sequence(vec![
///     MockTurn::tool_call("bash", json!({"command": "ls"})),
///     MockTurn::text("All done."),
/// ]);
/// ```
#[derive(Debug)]
pub struct MockProvider {
    turns: Vec<MockTurn>,
    cursor: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockProvider {
    /// Create a provider that plays `turns` in order, repeating the last
    /// turn once the script runs out.
    #[must_use]
    pub fn sequence(turns: Vec<MockTurn>) -> Self {
        Self {
            turns,
            cursor: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Create a provider that returns the same turn forever.
    #[must_use]
    pub fn repeating(turn: MockTurn) -> Self {
        Self::sequence(vec![turn])
    }

    /// Number of chat calls received so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Snapshot of every request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let turn = self
            .turns
            .get(index)
            .or_else(|| self.turns.last())
            .ok_or_else(|| Error::internal("mock provider has no scripted turns"))?;
        turn.response.clone()
    }

    fn name(&self) -> &'static str {
        "mock"
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }
}
