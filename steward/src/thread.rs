//! Threads: checkpointable, forkable conversation state.
//!
//! A thread owns its context store and a stack of immutable checkpoints.
//! Restoring replaces the live state with a deep copy of the snapshot and
//! discards every checkpoint created after it; forking produces a sibling
//! thread that shares history up to the fork point and then diverges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ContextStore;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::plan::Plan;
use crate::usage::Usage;

/// Default checkpoint retention.
pub const DEFAULT_MAX_CHECKPOINTS: usize = 20;

/// An immutable snapshot of thread state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint id.
    pub id: String,
    /// Optional label ("before-refactor").
    pub label: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Deep copy of the message log.
    pub messages: Vec<Message>,
    /// Deep copy of the plan.
    pub plan: Option<Plan>,
    /// Usage at snapshot time.
    pub usage: Usage,
}

/// One conversation thread.
#[derive(Debug)]
pub struct Thread {
    id: String,
    context: ContextStore,
    plan: Option<Plan>,
    checkpoints: Vec<Checkpoint>,
    max_checkpoints: usize,
}

impl Thread {
    /// Create an empty thread.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            context: ContextStore::new(),
            plan: None,
            checkpoints: Vec::new(),
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
        }
    }

    /// Create a thread around an existing context store.
    #[must_use]
    pub fn with_context(context: ContextStore) -> Self {
        Self {
            context,
            ..Self::new()
        }
    }

    /// Override checkpoint retention (minimum 1).
    #[must_use]
    pub fn with_max_checkpoints(mut self, max: usize) -> Self {
        self.max_checkpoints = max.max(1);
        self
    }

    /// Thread id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The context store.
    #[must_use]
    pub const fn context(&self) -> &ContextStore {
        &self.context
    }

    /// Mutable access to the context store.
    pub const fn context_mut(&mut self) -> &mut ContextStore {
        &mut self.context
    }

    /// The plan, if any.
    #[must_use]
    pub const fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    /// Attach or replace the plan.
    pub fn set_plan(&mut self, plan: Option<Plan>) {
        self.plan = plan;
    }

    /// Checkpoints, oldest first.
    #[must_use]
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Snapshot the current state.
    ///
    /// Retention: at most `max_checkpoints` are kept; the oldest is
    /// evicted on overflow, but never the most recent.
    pub fn create_checkpoint(&mut self, label: Option<String>, usage: Usage) -> String {
        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            label,
            created_at: Utc::now(),
            messages: self.context.messages().to_vec(),
            plan: self.plan.clone(),
            usage,
        };
        let id = checkpoint.id.clone();
        self.checkpoints.push(checkpoint);

        while self.checkpoints.len() > self.max_checkpoints {
            // Never evict the most recent; dropping index 0 cannot, since
            // max_checkpoints ≥ 1 keeps at least the newest.
            self.checkpoints.remove(0);
        }
        id
    }

    /// Restore a checkpoint, replacing live state with a deep copy of its
    /// snapshot and discarding all checkpoints created after it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for an unknown id.
    pub fn restore_checkpoint(&mut self, id: &str) -> Result<Usage> {
        let index = self
            .checkpoints
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| Error::invalid_request(format!("unknown checkpoint '{id}'")))?;

        let checkpoint = &self.checkpoints[index];
        self.context.replace(checkpoint.messages.clone());
        self.plan = checkpoint.plan.clone();
        let usage = checkpoint.usage;

        self.checkpoints.truncate(index + 1);
        Ok(usage)
    }

    /// Fork: a sibling thread sharing history up to this point.
    ///
    /// The fork gets a deep copy of the messages and plan, a fresh id, and
    /// no checkpoints; the two threads evolve independently afterwards.
    #[must_use]
    pub fn fork(&self, _label: Option<String>) -> Self {
        let mut context = ContextStore::with_compaction(*self.context.compaction_config());
        context.replace(self.context.messages().to_vec());
        Self {
            id: Uuid::new_v4().to_string(),
            context,
            plan: self.plan.clone(),
            checkpoints: Vec::new(),
            max_checkpoints: self.max_checkpoints,
        }
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}
