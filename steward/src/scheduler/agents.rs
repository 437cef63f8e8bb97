//! Subagent spawning and lifecycle.
//!
//! A child run gets a fresh scheduler, context, and budget; the parent's
//! clock is paused for the span of the child so wall-clock limits account
//! for real work only. Children inherit a derived cancellation signal and
//! share the parent's event bus; they never reach back into the parent.

use std::collections::HashMap;

use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use super::{CancelHandle, RunOutcome, Scheduler, SchedulerConfig};
use crate::budget::BudgetLimits;
use crate::events::Event;
use super::resilience::ResilienceConfig;

/// Options for one subagent run.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Child budget; defaults to the subagent preset.
    pub limits: BudgetLimits,
    /// Model override; defaults to the parent's model.
    pub model: Option<String>,
    /// Display label.
    pub label: Option<String>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            limits: BudgetLimits::subagent(),
            model: None,
            label: None,
        }
    }
}

/// Handle to a detached child run.
#[derive(Debug)]
pub struct ChildHandle {
    /// Child agent id.
    pub agent_id: String,
    join: JoinHandle<RunOutcome>,
    cancel: CancelHandle,
}

impl ChildHandle {
    /// Cancel the child run.
    pub fn cancel(&self, reason: Option<String>) {
        self.cancel.cancel(reason);
    }

    /// Await the child's outcome. `None` if the child task panicked.
    pub async fn join(self) -> Option<RunOutcome> {
        match self.join.await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                warn!(error = %err, "subagent task failed");
                None
            }
        }
    }

    /// Whether the child has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Parent-side registry of spawned children.
///
/// The parent owns the map `agent_id → handle`; children emit onto the
/// shared event bus and never hold a reference to the parent.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    children: HashMap<String, ChildHandle>,
}

impl AgentRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of children still registered.
    #[must_use]
    pub fn agent_ids(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }

    /// Register a spawned child.
    pub fn register(&mut self, handle: ChildHandle) -> String {
        let id = handle.agent_id.clone();
        self.children.insert(id.clone(), handle);
        id
    }

    /// Take a child handle out of the registry.
    pub fn take(&mut self, agent_id: &str) -> Option<ChildHandle> {
        self.children.remove(agent_id)
    }

    /// Cancel every registered child.
    pub fn cancel_all(&self, reason: Option<String>) {
        for handle in self.children.values() {
            handle.cancel(reason.clone());
        }
    }
}

impl Scheduler {
    /// Build a child scheduler sharing this one's provider, registry,
    /// policy, and event bus, with a fresh context and budget.
    fn child_scheduler(&self, task_label: Option<&str>, options: &SpawnOptions) -> Scheduler {
        let mut config = SchedulerConfig {
            model: options
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            ..self.config.clone()
        };
        // Children always start from a clean slate.
        config.continuation = false;
        config.system_prompt = self.config.system_prompt.clone();

        let mut builder = Scheduler::builder(std::sync::Arc::clone(&self.provider))
            .registry(std::sync::Arc::clone(&self.registry))
            .policy(self.policy.clone())
            .limits(options.limits)
            .config(config)
            .resilience(ResilienceConfig::new())
            .events(self.events.clone());
        if let Some(capability) = &self.worker_capability {
            builder = builder.worker_capability(capability.clone());
        }
        if let Some(task_type) = task_label.or(self.task_type.as_deref()) {
            builder = builder.task_type(task_type.to_owned());
        }
        builder.build()
    }

    /// Run a subagent inline: the parent's clock is paused for the span of
    /// the child and the child's outcome is returned directly.
    pub async fn run_subagent(&mut self, task: &str, options: SpawnOptions) -> RunOutcome {
        let agent_id = Uuid::new_v4().to_string();
        self.events.emit(Event::AgentSpawn {
            agent_id: agent_id.clone(),
        });

        self.governor.pause_duration();
        let mut child = self.child_scheduler(options.label.as_deref(), &options);

        // The child inherits cancellation: if the parent is already
        // cancelled, the child observes it before doing any work.
        if let Some(reason) = self.cancelled() {
            child.cancel_handle().cancel(Some(reason));
        }

        let outcome = child.run(task).await;
        self.governor.resume_duration();

        self.events.emit(Event::AgentComplete {
            agent_id,
            success: outcome.status.success,
        });
        outcome
    }

    /// Spawn a detached subagent and register it.
    ///
    /// The parent's clock pauses until the child is joined through
    /// [`Scheduler::join_subagent`]. The child receives a derived
    /// cancellation signal: cancelling the parent cancels the child.
    pub fn spawn_subagent(
        &mut self,
        registry: &mut AgentRegistry,
        task: impl Into<String>,
        options: SpawnOptions,
    ) -> String {
        let agent_id = Uuid::new_v4().to_string();
        let task = task.into();

        self.events.emit(Event::AgentSpawn {
            agent_id: agent_id.clone(),
        });
        self.governor.pause_duration();

        let child = self.child_scheduler(options.label.as_deref(), &options);
        let child_cancel = child.cancel_handle();

        // Derive the child's cancellation from the parent's.
        let mut parent_rx = self.cancel_rx.clone();
        let derived = child_cancel.clone();
        tokio::spawn(async move {
            if parent_rx.changed().await.is_ok() {
                let reason = parent_rx.borrow().clone();
                derived.cancel(reason);
            }
        });
        if let Some(reason) = self.cancelled() {
            child_cancel.cancel(Some(reason));
        }

        let join = tokio::spawn(async move {
            let mut child = child;
            child.run(&task).await
        });

        registry.register(ChildHandle {
            agent_id: agent_id.clone(),
            join,
            cancel: child_cancel,
        });
        agent_id
    }

    /// Join a spawned subagent, resuming the parent clock.
    pub async fn join_subagent(
        &mut self,
        registry: &mut AgentRegistry,
        agent_id: &str,
    ) -> Option<RunOutcome> {
        let handle = registry.take(agent_id)?;
        let outcome = handle.join().await;
        self.governor.resume_duration();
        self.events.emit(Event::AgentComplete {
            agent_id: agent_id.to_owned(),
            success: outcome.as_ref().is_some_and(|o| o.status.success),
        });
        outcome
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::providers::{MockProvider, MockTurn};
    use crate::scheduler::CompletionReason;
    use std::sync::Arc;

    fn scheduler_with(turns: Vec<MockTurn>) -> Scheduler {
        Scheduler::builder(Arc::new(MockProvider::sequence(turns)))
            .limits(BudgetLimits::unlimited().with_max_iterations(10))
            .build()
    }

    #[tokio::test]
    async fn inline_subagent_returns_outcome() {
        let mut parent = scheduler_with(vec![MockTurn::text("parent done")]);
        let outcome = parent
            .run_subagent("summarize the repo", SpawnOptions::default())
            .await;
        assert!(outcome.status.success);
        assert_eq!(outcome.status.reason, CompletionReason::Completed);
        // Parent usage is untouched by the child's run.
        assert!(parent.usage().is_empty());
    }

    #[tokio::test]
    async fn detached_subagent_joins() {
        let mut parent = scheduler_with(vec![MockTurn::text("child done")]);
        let mut agents = AgentRegistry::new();

        let id = parent.spawn_subagent(&mut agents, "do a thing", SpawnOptions::default());
        assert_eq!(agents.agent_ids(), vec![id.clone()]);

        let outcome = parent.join_subagent(&mut agents, &id).await.unwrap();
        assert!(outcome.status.success);
        assert!(agents.agent_ids().is_empty());
    }

    #[tokio::test]
    async fn parent_cancellation_propagates() {
        // A child whose provider never settles quickly; cancel the parent
        // and the derived signal must stop the child.
        let mut parent = scheduler_with(vec![MockTurn::text("unused")]);
        let mut agents = AgentRegistry::new();

        let id = parent.spawn_subagent(
            &mut agents,
            "long task",
            SpawnOptions::default(),
        );
        parent.cancel_handle().cancel(Some("shutting down".into()));

        // The child either finished before the cancel landed or reports
        // cancellation; both are valid races, but it must terminate.
        let outcome = parent.join_subagent(&mut agents, &id).await.unwrap();
        assert!(matches!(
            outcome.status.reason,
            CompletionReason::Completed | CompletionReason::Cancelled
        ));
    }

    #[tokio::test]
    async fn spawn_emits_lifecycle_events() {
        let mut parent = scheduler_with(vec![MockTurn::text("done")]);
        let mut rx = parent.events().subscribe();
        let outcome = parent.run_subagent("task", SpawnOptions::default()).await;
        assert!(outcome.status.success);

        let mut saw_spawn = false;
        let mut saw_complete = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::AgentSpawn { .. } => saw_spawn = true,
                Event::AgentComplete { success, .. } => {
                    saw_complete = true;
                    assert!(success);
                }
                _ => {}
            }
        }
        assert!(saw_spawn && saw_complete);
    }
}
