//! Completion validation and bounded recovery.
//!
//! When the model stops calling tools and produces text, the run has a
//! *candidate* completion. Host-supplied criteria can reject it (missing
//! artifact, open tasks, "I will do X next" future intent), in which case
//! the scheduler injects a recovery prompt and continues, a bounded number
//! of times.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Default bounded recovery attempts within one run.
pub const DEFAULT_RECOVERY_ATTEMPTS: u32 = 2;

/// Outcome of validating a candidate completion.
#[derive(Debug, Clone, Default)]
pub struct CriteriaOutcome {
    /// Whether the completion is acceptable.
    pub met: bool,
    /// What is missing, used to build the recovery prompt.
    pub detail: Option<String>,
    /// Tasks the validator believes remain open.
    pub open_tasks: Vec<String>,
    /// The text reads as deferred work ("next I will…").
    pub future_intent: bool,
}

impl CriteriaOutcome {
    /// An accepting outcome.
    #[must_use]
    pub fn accept() -> Self {
        Self {
            met: true,
            ..Self::default()
        }
    }

    /// A rejecting outcome with a reason.
    #[must_use]
    pub fn reject(detail: impl Into<String>) -> Self {
        Self {
            met: false,
            detail: Some(detail.into()),
            ..Self::default()
        }
    }
}

/// Host-supplied completion criteria.
#[async_trait]
pub trait CompletionCriteria: Send + Sync {
    /// Judge a candidate completion against the conversation so far.
    async fn validate(&self, content: &str, messages: &[Message]) -> CriteriaOutcome;
}

/// Recovery configuration for one run.
#[derive(Clone, Default)]
pub struct ResilienceConfig {
    /// Bounded recovery retries (0 disables recovery).
    pub max_recovery_attempts: u32,
    /// Optional completion criteria.
    pub criteria: Option<Arc<dyn CompletionCriteria>>,
}

impl std::fmt::Debug for ResilienceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceConfig")
            .field("max_recovery_attempts", &self.max_recovery_attempts)
            .field("has_criteria", &self.criteria.is_some())
            .finish()
    }
}

impl ResilienceConfig {
    /// Default config: bounded retries, no criteria.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_recovery_attempts: DEFAULT_RECOVERY_ATTEMPTS,
            criteria: None,
        }
    }

    /// Attach completion criteria.
    #[must_use]
    pub fn with_criteria(mut self, criteria: Arc<dyn CompletionCriteria>) -> Self {
        self.criteria = Some(criteria);
        self
    }

    /// Override the retry bound.
    #[must_use]
    pub const fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }
}

/// How a run recovered (or failed to), reported in the terminal status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    /// Recovery prompts injected within this run.
    pub intra_run_retries: u32,
    /// Automatic re-runs around this run (managed by the host loop).
    pub auto_loop_runs: u32,
    /// Recovery was exhausted; the stop is final.
    pub terminal: bool,
    /// Reasons accumulated along the way, oldest first.
    pub reason_chain: Vec<String>,
}

impl RecoveryInfo {
    /// Record one recovery attempt with its reason.
    pub fn record_retry(&mut self, reason: impl Into<String>) {
        self.intra_run_retries += 1;
        self.reason_chain.push(reason.into());
    }
}
