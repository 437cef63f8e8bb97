//! Optional structured plan attached to a thread.
//!
//! Steps carry stable ids and are renumbered after every mutation, so UIs
//! can refer to "step 3" while the runtime tracks identity across edits.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Plan lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Being drafted.
    #[default]
    Draft,
    /// Under discussion with the user.
    Discussing,
    /// Approved for execution.
    Approved,
    /// Executing.
    Executing,
    /// Paused.
    Paused,
    /// All steps done.
    Completed,
    /// Execution failed.
    Failed,
    /// Abandoned.
    Cancelled,
}

/// Step lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started.
    #[default]
    Pending,
    /// In progress.
    InProgress,
    /// Done.
    Completed,
    /// Skipped.
    Skipped,
    /// Failed.
    Failed,
}

/// One plan step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Stable identity, preserved across renumbering.
    pub id: String,
    /// 1-based display number; recomputed after every mutation.
    pub number: usize,
    /// What to do.
    pub description: String,
    /// Current status.
    pub status: StepStatus,
    /// Ids of steps this one depends on.
    #[serde(default)]
    pub deps: Vec<String>,
    /// Choices the user may pick between, for decision steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_options: Option<Vec<String>>,
}

impl PlanStep {
    /// Create a pending step with a fresh id.
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            number: 0,
            description: description.into(),
            status: StepStatus::Pending,
            deps: Vec::new(),
            decision_options: None,
        }
    }

    /// Add a dependency on another step's id.
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.deps.push(id.into());
        self
    }
}

/// A goal broken into ordered steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// The overall goal.
    pub goal: String,
    /// Ordered steps.
    pub steps: Vec<PlanStep>,
    /// Index of the step currently being executed.
    pub current_step_index: usize,
    /// Plan status.
    pub status: PlanStatus,
}

impl Plan {
    /// Create an empty plan for `goal`.
    #[must_use]
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            steps: Vec::new(),
            current_step_index: 0,
            status: PlanStatus::Draft,
        }
    }

    /// Append a step and renumber.
    pub fn add_step(&mut self, step: PlanStep) {
        self.steps.push(step);
        self.renumber();
    }

    /// Insert a step at `index` (clamped) and renumber.
    pub fn insert_step(&mut self, index: usize, step: PlanStep) {
        let index = index.min(self.steps.len());
        self.steps.insert(index, step);
        self.renumber();
    }

    /// Remove a step by id and renumber. Dangling deps are pruned.
    pub fn remove_step(&mut self, id: &str) -> Option<PlanStep> {
        let index = self.steps.iter().position(|s| s.id == id)?;
        let removed = self.steps.remove(index);
        for step in &mut self.steps {
            step.deps.retain(|d| d != id);
        }
        if self.current_step_index >= self.steps.len() && self.current_step_index > 0 {
            self.current_step_index = self.steps.len().saturating_sub(1);
        }
        self.renumber();
        Some(removed)
    }

    /// The step currently executing.
    #[must_use]
    pub fn current_step(&self) -> Option<&PlanStep> {
        self.steps.get(self.current_step_index)
    }

    /// Mark the current step done and move to the next. Returns `false`
    /// when there is no further step (the plan is complete).
    pub fn advance(&mut self) -> bool {
        if let Some(step) = self.steps.get_mut(self.current_step_index) {
            step.status = StepStatus::Completed;
        }
        if self.current_step_index + 1 < self.steps.len() {
            self.current_step_index += 1;
            true
        } else {
            self.status = PlanStatus::Completed;
            false
        }
    }

    /// Whether a step's dependencies are all completed.
    #[must_use]
    pub fn deps_satisfied(&self, step: &PlanStep) -> bool {
        step.deps.iter().all(|dep| {
            self.steps
                .iter()
                .find(|s| &s.id == dep)
                .is_none_or(|s| s.status == StepStatus::Completed)
        })
    }

    fn renumber(&mut self) {
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.number = i + 1;
        }
    }
}
