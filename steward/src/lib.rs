#![cfg_attr(docsrs, feature(doc_cfg))]
//! Steward is a policy-governed agent runtime: it drives an iterative loop
//! between an LLM and a set of side-effecting tools under strict resource
//! discipline and safety policy.
//!
//! The core pieces:
//!
//! - [`scheduler`] — the iteration loop: verdicts, guidance injection, LLM
//!   calls, tool dispatch, cancellation, subagents
//! - [`governor`] + [`budget`] + [`progress`] — budget accounting, doom-loop
//!   and exploration-saturation detection, phase tracking
//! - [`policy`] + [`approval`] — profile-driven tool/command gating with
//!   symlink-resolved path confinement and human-in-the-loop approval
//! - [`mcp`] — long-lived JSON-RPC connections to tool-provider
//!   subprocesses with a lazily loaded tool catalog
//! - [`context`] + [`thread`] — the ordered message log with token
//!   accounting, compaction, checkpoints, and forking
//!
//! # Example
//!
//! ```rust,ignore
//! use steward::prelude::*;
//!
//! let mut scheduler = Scheduler::builder(provider)
//!     .registry(registry)
//!     .policy(PolicyEngine::permissive())
//!     .limits(BudgetLimits::standard())
//!     .build();
//!
//! let outcome = scheduler.run("fix the failing test in src/parser.rs").await;
//! println!("{:?}: {:?}", outcome.status.reason, outcome.final_message);
//! ```

pub mod approval;
pub mod budget;
pub mod context;
pub mod error;
pub mod events;
pub mod governor;
pub mod llm;
pub mod mcp;
pub mod message;
pub mod plan;
pub mod policy;
pub mod prelude;
pub mod progress;
pub mod prompts;
pub mod providers;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod thread;
pub mod tool;
pub mod usage;

pub use error::{Error, Result};
pub use events::{Event, EventBus};
pub use llm::{ChatRequest, ChatResponse, LlmProvider, SharedProvider};
pub use message::{Message, Role, ToolCall};
pub use scheduler::{
    CancelHandle, CompletionReason, CompletionStatus, RunOutcome, Scheduler, SchedulerConfig,
};
pub use usage::Usage;
