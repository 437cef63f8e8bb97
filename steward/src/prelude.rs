//! Convenience re-exports for building on the runtime.
//!
//! ```rust,ignore
//! use steward::prelude::*;
//! ```

pub use crate::approval::{ApprovalGate, ApprovalHandler, ApprovalRequest, ApprovalResponse, RiskLevel};
pub use crate::budget::{Budget, BudgetDimension, BudgetLimits, ExtensionDecision, ExtensionHandler};
pub use crate::context::{ContextStore, estimate_tokens};
pub use crate::error::{Error, Result};
pub use crate::events::{Event, EventBus};
pub use crate::governor::{Governor, SuggestedAction, Verdict};
pub use crate::llm::{ChatRequest, ChatResponse, LlmProvider, LlmUsage, SharedProvider, StopReason, ToolChoice};
pub use crate::mcp::{McpClient, McpConfig, ServerConfig};
pub use crate::message::{Content, ContentBlock, Message, Role, ToolCall};
pub use crate::plan::{Plan, PlanStep};
pub use crate::policy::{BashMode, PolicyDecision, PolicyEngine, PolicyProfile};
pub use crate::progress::Phase;
pub use crate::registry::{ExecuteOutcome, ToolRegistry};
pub use crate::scheduler::{
    AgentRegistry, CancelHandle, CompletionCriteria, CompletionReason, CompletionStatus,
    ResilienceConfig, RunOutcome, Scheduler, SchedulerBuilder, SchedulerConfig, SpawnOptions,
};
pub use crate::session::{InMemorySessionStore, SessionMeta, SessionStore, SessionType};
pub use crate::thread::{Checkpoint, Thread};
pub use crate::tool::{DangerLevel, DynTool, FnTool, SharedTool, ToolDefinition};
pub use crate::usage::Usage;
