//! The iteration scheduler: the runtime's orchestrator.
//!
//! One run drives the loop: ask the governor for a verdict, inject any
//! guidance, call the LLM, dispatch requested tools through policy,
//! approval, and the registry, feed results back into context, and decide
//! whether to continue. Everything observable is emitted on the event bus
//! in a fixed order per iteration.

pub mod agents;
pub mod resilience;

pub use agents::{AgentRegistry, ChildHandle, SpawnOptions};
pub use resilience::{
    CompletionCriteria, CriteriaOutcome, RecoveryInfo, ResilienceConfig,
};

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{Instrument, info, info_span, warn};

use crate::approval::ApprovalGate;
use crate::budget::BudgetLimits;
use crate::error::Error;
use crate::events::{Event, EventBus};
use crate::governor::{Governor, GovernorSignal, SuggestedAction};
use crate::llm::{ChatRequest, ChatResponse, SharedProvider, ToolChoice};
use crate::message::{Message, ToolCall};
use crate::policy::{EvaluationContext, PolicyDecision, PolicyEngine};
use crate::prompts;
use crate::registry::{ExecuteOutcome, ToolRegistry};
use crate::thread::Thread;
use crate::tool::DangerLevel;
use crate::usage::Usage;

/// Why a run terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// The model produced an accepted final answer.
    Completed,
    /// A duration or host resource limit was hit.
    ResourceLimit,
    /// A token or cost budget was exhausted.
    BudgetLimit,
    /// The iteration budget ran out (after the summary turn).
    MaxIterations,
    /// The context could not be shrunk below the model limit.
    HardContextLimit,
    /// The model stopped without finishing the action it started.
    IncompleteAction,
    /// The completion left validated tasks open.
    OpenTasks,
    /// The completion deferred work to a future turn.
    FutureIntent,
    /// A subagent swarm failed.
    SwarmFailure,
    /// An unrecoverable error.
    Error,
    /// The run was cancelled.
    Cancelled,
}

/// Terminal status of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionStatus {
    /// Whether the run achieved its goal.
    pub success: bool,
    /// Why it stopped.
    pub reason: CompletionReason,
    /// Human-readable details.
    pub details: Option<String>,
    /// Open tasks reported by the completion criteria.
    pub open_tasks: Vec<String>,
    /// The final text deferred work to a future turn.
    pub future_intent_detected: bool,
    /// How recovery behaved along the way.
    pub recovery: RecoveryInfo,
}

impl CompletionStatus {
    fn new(success: bool, reason: CompletionReason, recovery: RecoveryInfo) -> Self {
        Self {
            success,
            reason,
            details: None,
            open_tasks: Vec::new(),
            future_intent_detected: false,
            recovery,
        }
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Terminal status.
    pub status: CompletionStatus,
    /// Usage at termination.
    pub usage: Usage,
    /// The last assistant text, when any.
    pub final_message: Option<String>,
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Model passed to the provider.
    pub model: String,
    /// Per-turn generation cap.
    pub max_tokens_per_turn: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Per-tool execution deadline.
    pub tool_timeout: Duration,
    /// Allow parallel dispatch for strictly safe batches.
    pub parallel_tools: bool,
    /// Keep usage/progress across `run` calls instead of resetting.
    pub continuation: bool,
    /// Grace given to an in-flight tool after cancellation.
    pub cancel_grace: Duration,
    /// System prompt seeded into an empty thread.
    pub system_prompt: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_tokens_per_turn: None,
            temperature: None,
            tool_timeout: Duration::from_secs(60),
            parallel_tools: false,
            continuation: false,
            cancel_grace: Duration::from_secs(5),
            system_prompt: None,
        }
    }
}

/// Cancellation signal: `None` means running, `Some(reason)` cancelled.
type CancelSignal = Option<String>;

/// Handle for cancelling a run from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<CancelSignal>>,
    events: EventBus,
}

impl CancelHandle {
    /// Request cooperative cancellation.
    pub fn cancel(&self, reason: Option<String>) {
        self.events.emit(Event::CancellationRequested {
            reason: reason.clone(),
        });
        let _ = self.tx.send(Some(reason.unwrap_or_default()));
    }
}

/// The orchestrator for one thread of agent execution.
pub struct Scheduler {
    provider: SharedProvider,
    registry: Arc<ToolRegistry>,
    policy: PolicyEngine,
    approval: ApprovalGate,
    governor: Governor,
    thread: Thread,
    events: EventBus,
    config: SchedulerConfig,
    resilience: ResilienceConfig,
    cancel_tx: Arc<watch::Sender<CancelSignal>>,
    cancel_rx: watch::Receiver<CancelSignal>,
    explicit_profile: Option<String>,
    worker_capability: Option<String>,
    task_type: Option<String>,
    pending_modified_args: Option<(String, Value)>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("model", &self.config.model)
            .field("thread", &self.thread.id())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Scheduler`].
pub struct SchedulerBuilder {
    provider: SharedProvider,
    registry: Arc<ToolRegistry>,
    policy: PolicyEngine,
    approval: ApprovalGate,
    limits: BudgetLimits,
    extension_handler: Option<Arc<dyn crate::budget::ExtensionHandler>>,
    config: SchedulerConfig,
    resilience: ResilienceConfig,
    events: Option<EventBus>,
    thread: Option<Thread>,
    explicit_profile: Option<String>,
    worker_capability: Option<String>,
    task_type: Option<String>,
}

impl std::fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("model", &self.config.model)
            .finish_non_exhaustive()
    }
}

impl SchedulerBuilder {
    /// Start a builder around a provider.
    #[must_use]
    pub fn new(provider: SharedProvider) -> Self {
        Self {
            provider,
            registry: Arc::new(ToolRegistry::new()),
            policy: PolicyEngine::permissive(),
            approval: ApprovalGate::new(crate::approval::RiskLevel::High),
            limits: BudgetLimits::standard(),
            extension_handler: None,
            config: SchedulerConfig::default(),
            resilience: ResilienceConfig::new(),
            events: None,
            thread: None,
            explicit_profile: None,
            worker_capability: None,
            task_type: None,
        }
    }

    /// Attach the tool registry.
    #[must_use]
    pub fn registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Attach the policy engine.
    #[must_use]
    pub fn policy(mut self, policy: PolicyEngine) -> Self {
        self.policy = policy;
        self
    }

    /// Attach the approval gate.
    #[must_use]
    pub fn approval(mut self, approval: ApprovalGate) -> Self {
        self.approval = approval;
        self
    }

    /// Set budget limits.
    #[must_use]
    pub fn limits(mut self, limits: BudgetLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Attach a budget extension handler.
    #[must_use]
    pub fn extension_handler(
        mut self,
        handler: Arc<dyn crate::budget::ExtensionHandler>,
    ) -> Self {
        self.extension_handler = Some(handler);
        self
    }

    /// Set scheduler configuration.
    #[must_use]
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the model.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    /// Set resilience configuration.
    #[must_use]
    pub fn resilience(mut self, resilience: ResilienceConfig) -> Self {
        self.resilience = resilience;
        self
    }

    /// Share an event bus (defaults to a fresh one).
    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Start from an existing thread.
    #[must_use]
    pub fn thread(mut self, thread: Thread) -> Self {
        self.thread = Some(thread);
        self
    }

    /// Force a specific policy profile.
    #[must_use]
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.explicit_profile = Some(profile.into());
        self
    }

    /// Set the worker capability used for profile resolution.
    #[must_use]
    pub fn worker_capability(mut self, capability: impl Into<String>) -> Self {
        self.worker_capability = Some(capability.into());
        self
    }

    /// Set the task type used for profile resolution.
    #[must_use]
    pub fn task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Build the scheduler.
    #[must_use]
    pub fn build(self) -> Scheduler {
        let mut config = self.config;
        if config.model.is_empty() {
            config.model = self.provider.default_model().to_owned();
        }

        let mut governor = Governor::new(self.limits);
        if let Some(handler) = self.extension_handler {
            governor = governor.with_extension_handler(handler);
        }

        let (cancel_tx, cancel_rx) = watch::channel(None);
        Scheduler {
            provider: self.provider,
            registry: self.registry,
            policy: self.policy,
            approval: self.approval,
            governor,
            thread: self.thread.unwrap_or_default(),
            events: self.events.unwrap_or_default(),
            config,
            resilience: self.resilience,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            explicit_profile: self.explicit_profile,
            worker_capability: self.worker_capability,
            task_type: self.task_type,
            pending_modified_args: None,
        }
    }
}

impl Scheduler {
    /// Start building a scheduler.
    #[must_use]
    pub fn builder(provider: SharedProvider) -> SchedulerBuilder {
        SchedulerBuilder::new(provider)
    }

    /// The event bus (clone to subscribe).
    #[must_use]
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// A handle that cancels this scheduler's runs.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
            events: self.events.clone(),
        }
    }

    /// Current usage.
    #[must_use]
    pub fn usage(&self) -> Usage {
        self.governor.usage()
    }

    /// The thread.
    #[must_use]
    pub const fn thread(&self) -> &Thread {
        &self.thread
    }

    /// Mutable thread access (between runs).
    pub const fn thread_mut(&mut self) -> &mut Thread {
        &mut self.thread
    }

    /// Snapshot the thread, emitting `checkpoint.created`.
    pub fn create_checkpoint(&mut self, label: Option<String>) -> String {
        let usage = self.governor.usage();
        let id = self.thread.create_checkpoint(label.clone(), usage);
        self.events.emit(Event::CheckpointCreated { id: id.clone(), label });
        id
    }

    /// Roll the thread back to a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for an unknown checkpoint id.
    pub fn restore_checkpoint(&mut self, id: &str) -> crate::error::Result<()> {
        self.thread.restore_checkpoint(id)?;
        self.events.emit(Event::Rollback {
            checkpoint_id: id.to_owned(),
        });
        self.events.emit(Event::CheckpointRestored { id: id.to_owned() });
        Ok(())
    }

    /// Fork the thread, emitting `thread.forked`.
    #[must_use]
    pub fn fork_thread(&self, label: Option<String>) -> Thread {
        let fork = self.thread.fork(label);
        self.events.emit(Event::ThreadForked {
            parent: self.thread.id().to_owned(),
            child: fork.id().to_owned(),
        });
        fork
    }

    fn policy_context(&self) -> EvaluationContext<'_> {
        EvaluationContext {
            explicit_profile: self.explicit_profile.as_deref(),
            worker_capability: self.worker_capability.as_deref(),
            task_type: self.task_type.as_deref(),
        }
    }

    fn cancelled(&self) -> Option<String> {
        self.cancel_rx.borrow().clone()
    }

    fn emit_signals(&self, signals: &[GovernorSignal]) {
        for signal in signals {
            let event = match signal {
                GovernorSignal::DoomLoop { tool, count } => Event::DoomLoopDetected {
                    tool: tool.clone(),
                    count: *count,
                },
                GovernorSignal::PhaseTransition { from, to } => Event::PhaseTransition {
                    from: *from,
                    to: *to,
                },
                GovernorSignal::ExplorationSaturation { files_read, iterations } => {
                    Event::ExplorationSaturation {
                        files_read: *files_read,
                        iterations: *iterations,
                    }
                }
                GovernorSignal::ProgressMade => Event::ProgressMade,
                GovernorSignal::Stuck { count } => Event::ProgressStuck { count: *count },
            };
            self.events.emit(event);
        }
    }

    /// Execute a run for `task` to termination.
    ///
    /// Never returns an error: every failure mode folds into the terminal
    /// [`CompletionStatus`].
    pub async fn run(&mut self, task: &str) -> RunOutcome {
        let span = info_span!(
            "run",
            thread = %self.thread.id(),
            model = %self.config.model,
            task_chars = task.len(),
        );
        self.run_inner(task).instrument(span).await
    }

    async fn run_inner(&mut self, task: &str) -> RunOutcome {
        if !self.config.continuation {
            self.governor.reset();
        }
        // A fresh run clears any stale cancellation from a previous one.
        if self.cancelled().is_some() && !self.config.continuation {
            let _ = self.cancel_tx.send(None);
            self.cancel_rx.mark_unchanged();
        }

        self.events.emit(Event::RunBefore {
            task: task.to_owned(),
        });

        if self.thread.context().is_empty()
            && let Some(system) = self.config.system_prompt.clone()
            && let Err(err) = self.thread.context_mut().append(Message::system(system))
        {
            warn!(error = %err, "failed to seed system prompt");
        }
        if let Err(err) = self.thread.context_mut().append(Message::user(task)) {
            let status =
                CompletionStatus::new(false, CompletionReason::Error, RecoveryInfo::default())
                    .with_details(err.to_string());
            self.events.emit(Event::RunAfter {
                status: status.clone(),
            });
            return RunOutcome {
                status,
                usage: self.governor.usage(),
                final_message: None,
            };
        }

        let mut recovery = RecoveryInfo::default();
        let status = self.run_loop(&mut recovery).await;

        info!(
            reason = ?status.reason,
            success = status.success,
            iterations = self.governor.usage().iterations,
            "run finished",
        );
        self.events.emit(Event::RunAfter {
            status: status.clone(),
        });
        RunOutcome {
            status,
            usage: self.governor.usage(),
            final_message: self.last_assistant_text(),
        }
    }

    fn last_assistant_text(&self) -> Option<String> {
        self.thread
            .context()
            .messages()
            .iter()
            .rev()
            .find(|m| m.role == crate::message::Role::Assistant)
            .map(Message::text)
            .filter(|t| !t.is_empty())
    }

    #[allow(clippy::too_many_lines)]
    async fn run_loop(&mut self, recovery: &mut RecoveryInfo) -> CompletionStatus {
        loop {
            // Cancellation is checked at every loop boundary.
            if let Some(reason) = self.cancelled() {
                self.events.emit(Event::CancellationCompleted);
                return CompletionStatus::new(
                    false,
                    CompletionReason::Cancelled,
                    std::mem::take(recovery),
                )
                .with_details(reason);
            }

            // 3a. Verdict.
            let (verdict, signals) = self.governor.check();
            self.emit_signals(&signals);
            let iteration = self.governor.usage().iterations + 1;
            self.events.emit(Event::IterationBefore { iteration });

            if !verdict.can_continue {
                let detail = verdict.reason.clone().unwrap_or_default();
                self.events.emit(Event::BudgetExceeded {
                    detail: detail.clone(),
                });
                let reason = match verdict.budget_type {
                    Some(crate::budget::BudgetDimension::Duration) => {
                        CompletionReason::ResourceLimit
                    }
                    _ => CompletionReason::BudgetLimit,
                };
                return CompletionStatus::new(false, reason, std::mem::take(recovery))
                    .with_details(detail);
            }

            match verdict.suggested_action {
                SuggestedAction::Warn => {
                    if let Some(reason) = &verdict.reason {
                        self.events.emit(Event::BudgetWarning {
                            detail: reason.clone(),
                        });
                    }
                }
                SuggestedAction::RequestExtension => {
                    let reason = verdict.reason.clone().unwrap_or_else(|| "soft limit".into());
                    let dimension = verdict
                        .budget_type
                        .unwrap_or(crate::budget::BudgetDimension::Tokens);
                    self.events.emit(Event::ExtensionRequested {
                        reason: reason.clone(),
                    });
                    let decision = self.governor.request_extension(&reason, dimension).await;
                    if decision.granted {
                        self.events.emit(Event::ExtensionGranted {
                            factor: decision
                                .factor
                                .unwrap_or(crate::budget::DEFAULT_EXTENSION_FACTOR),
                        });
                    } else {
                        self.events.emit(Event::ExtensionDenied);
                    }
                }
                SuggestedAction::Continue | SuggestedAction::Stop => {}
            }

            // 3b. Guidance injection.
            if let Some(prompt) = &verdict.injected_prompt
                && let Err(err) = self.thread.context_mut().append(Message::system(prompt.clone()))
            {
                warn!(error = %err, "failed to inject guidance prompt");
            }

            // Automatic compaction ahead of the call.
            self.compact_if_needed().await;

            // 3c. LLM call.
            self.events.emit(Event::LlmStart { iteration });
            let response = match self.call_llm_with_recovery(verdict.force_text_only).await {
                Ok(response) => response,
                Err(status) => return status.finish(recovery),
            };

            let usage = response.usage.unwrap_or_default();
            self.governor.record_llm_usage(
                usage.input_tokens,
                usage.output_tokens,
                &self.config.model,
                usage.cost,
            );
            self.events.emit(Event::LlmComplete {
                iteration,
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            });
            match usage.cached_tokens {
                Some(tokens) if tokens > 0 => self.events.emit(Event::CacheHit { tokens }),
                _ => self.events.emit(Event::CacheMiss),
            }

            // 3d. Append the assistant message.
            if let Err(err) = self.thread.context_mut().append(response.message.clone()) {
                return CompletionStatus::new(
                    false,
                    CompletionReason::Error,
                    std::mem::take(recovery),
                )
                .with_details(format!("assistant message rejected: {err}"));
            }
            self.governor.record_iteration();

            // 3e. Forced summary turn ends the run.
            if verdict.force_text_only {
                self.events.emit(Event::IterationAfter { iteration });
                return CompletionStatus::new(
                    false,
                    CompletionReason::MaxIterations,
                    std::mem::take(recovery),
                )
                .with_details(verdict.reason.unwrap_or_default());
            }

            // 3f. Tool dispatch.
            let calls = response.tool_calls().to_vec();
            if !calls.is_empty() {
                self.dispatch_calls(&calls).await;
                self.events.emit(Event::IterationAfter { iteration });
                continue;
            }

            // 3g. Candidate completion.
            let content = response.text();
            let outcome = if content.trim().is_empty() {
                CriteriaOutcome::reject("the assistant produced neither text nor tool calls")
            } else if let Some(criteria) = self.resilience.criteria.clone() {
                criteria
                    .validate(&content, self.thread.context().messages())
                    .await
            } else {
                CriteriaOutcome::accept()
            };

            self.events.emit(Event::IterationAfter { iteration });

            if outcome.met {
                if recovery.intra_run_retries > 0 {
                    self.events.emit(Event::ResilienceRecovered);
                }
                return CompletionStatus::new(
                    true,
                    CompletionReason::Completed,
                    std::mem::take(recovery),
                );
            }

            let detail = outcome
                .detail
                .clone()
                .unwrap_or_else(|| "completion criteria not met".to_owned());
            if recovery.intra_run_retries < self.resilience.max_recovery_attempts {
                recovery.record_retry(detail.clone());
                self.events.emit(Event::ResilienceRetry {
                    attempt: recovery.intra_run_retries,
                    reason: detail.clone(),
                });
                let prompt = prompts::completion_recovery(&detail);
                if let Err(err) = self.thread.context_mut().append(Message::system(prompt)) {
                    warn!(error = %err, "failed to inject recovery prompt");
                }
                continue;
            }

            recovery.terminal = true;
            recovery.reason_chain.push(detail.clone());
            self.events.emit(Event::ResilienceFailed {
                reason: detail.clone(),
            });
            let reason = if outcome.future_intent {
                CompletionReason::FutureIntent
            } else if outcome.open_tasks.is_empty() {
                CompletionReason::IncompleteAction
            } else {
                CompletionReason::OpenTasks
            };
            let mut status =
                CompletionStatus::new(false, reason, std::mem::take(recovery)).with_details(detail);
            status.open_tasks = outcome.open_tasks;
            status.future_intent_detected = outcome.future_intent;
            return status;
        }
    }

    /// Run automatic compaction when the context estimate crosses the
    /// configured threshold.
    async fn compact_if_needed(&mut self) {
        let threshold = self.thread.context().compaction_config().threshold;
        if self.thread.context().estimated_tokens() < threshold {
            return;
        }
        let provider = Arc::clone(&self.provider);
        let model = self.config.model.clone();
        match self
            .thread
            .context_mut()
            .compact(provider.as_ref(), &model)
            .await
        {
            Ok(result) if result.compacted => {
                self.events.emit(Event::CompactionAuto {
                    tokens_before: result.tokens_before,
                    tokens_after: result.tokens_after,
                });
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "automatic compaction failed"),
        }
    }

    /// Call the LLM, handling cancellation, context overflow (emergency
    /// compaction plus one retry), and terminal provider errors.
    async fn call_llm_with_recovery(
        &mut self,
        force_text_only: bool,
    ) -> std::result::Result<ChatResponse, PendingStatus> {
        let mut compacted_once = false;
        loop {
            let request = self.build_request(force_text_only);
            match self.call_llm(&request).await {
                Ok(response) => return Ok(response),
                Err(Error::Cancelled { reason }) => {
                    self.events.emit(Event::CancellationCompleted);
                    return Err(PendingStatus {
                        success: false,
                        reason: CompletionReason::Cancelled,
                        details: reason,
                    });
                }
                Err(Error::ContextLengthExceeded { estimated, limit }) if !compacted_once => {
                    compacted_once = true;
                    warn!(estimated, limit, "context overflow; compacting");
                    let before = self.thread.context().estimated_tokens();
                    let provider = Arc::clone(&self.provider);
                    let model = self.config.model.clone();
                    let result = self
                        .thread
                        .context_mut()
                        .compact(provider.as_ref(), &model)
                        .await;
                    let after = self.thread.context().estimated_tokens();
                    match result {
                        Ok(outcome) if outcome.compacted && after < before => {
                            self.events.emit(Event::CompactionAuto {
                                tokens_before: before,
                                tokens_after: after,
                            });
                        }
                        _ => {
                            return Err(PendingStatus {
                                success: false,
                                reason: CompletionReason::HardContextLimit,
                                details: Some(format!(
                                    "context at {estimated} tokens exceeds {limit} and could not be compacted"
                                )),
                            });
                        }
                    }
                }
                Err(err) => {
                    return Err(PendingStatus {
                        success: false,
                        reason: if matches!(err, Error::ContextLengthExceeded { .. }) {
                            CompletionReason::HardContextLimit
                        } else {
                            CompletionReason::Error
                        },
                        details: Some(err.to_string()),
                    });
                }
            }
        }
    }

    fn build_request(&self, force_text_only: bool) -> ChatRequest {
        let mut request = ChatRequest::new(
            self.config.model.clone(),
            self.thread.context().messages().to_vec(),
        );
        if let Some(max_tokens) = self.config.max_tokens_per_turn {
            request = request.max_tokens(max_tokens);
        }
        if let Some(temperature) = self.config.temperature {
            request = request.temperature(temperature);
        }
        if force_text_only {
            request = request.tool_choice(ToolChoice::None);
        } else {
            let tools = self.registry.descriptions();
            if !tools.is_empty() {
                request = request.tools(tools).tool_choice(ToolChoice::Auto);
            }
        }
        request
    }

    async fn call_llm(&self, request: &ChatRequest) -> crate::error::Result<ChatResponse> {
        let mut cancel_rx = self.cancel_rx.clone();
        tokio::select! {
            response = self.provider.chat(request) => response,
            _ = cancel_rx.changed() => Err(Error::cancelled(self.cancelled())),
        }
    }

    /// Dispatch one turn's tool calls in order.
    ///
    /// Sequential by default. A batch runs in parallel only when parallel
    /// dispatch is enabled, every call's policy resolved to `allow`, and
    /// no call is write-class.
    async fn dispatch_calls(&mut self, calls: &[ToolCall]) {
        let context = self.policy_context();
        let evaluations: Vec<_> = calls
            .iter()
            .map(|call| self.policy.evaluate_tool(call, &context))
            .collect();

        for evaluation in &evaluations {
            self.events.emit(Event::PolicyProfileResolved {
                profile: evaluation.profile.name.clone(),
                source: evaluation.profile.source,
            });
        }

        let parallel_safe = self.config.parallel_tools
            && evaluations
                .iter()
                .all(|e| e.decision == PolicyDecision::Allow)
            && calls.iter().all(|c| !self.is_write_class(&c.name));

        if parallel_safe {
            self.dispatch_parallel(calls).await;
            return;
        }

        for (call, evaluation) in calls.iter().zip(&evaluations) {
            // Cancellation declines any further dispatch.
            if self.cancelled().is_some() {
                break;
            }

            match evaluation.decision {
                PolicyDecision::Forbidden => {
                    self.append_tool_message(
                        &call.id,
                        format!("Blocked by policy: {}", evaluation.reason),
                    );
                    if call.name == "bash" {
                        let command = call
                            .arguments
                            .get("command")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        self.events.emit(Event::PolicyBashBlocked {
                            command: command.to_owned(),
                            reason: evaluation.reason.clone(),
                        });
                    }
                    self.events.emit(Event::PolicyToolBlocked {
                        tool: call.name.clone(),
                        reason: evaluation.reason.clone(),
                        profile: evaluation.profile.name.clone(),
                    });
                    continue;
                }
                PolicyDecision::Prompt => {
                    if !self.seek_approval(call).await {
                        continue;
                    }
                }
                PolicyDecision::Allow => {
                    // High-risk calls need approval even when policy allows.
                    let rules = self.policy.approval_rules(&self.policy_context());
                    if self.approval.requires_approval(call, &rules)
                        && !self.seek_approval(call).await
                    {
                        continue;
                    }
                }
            }

            let executed = self.approved_call(call);
            self.run_one(&executed).await;
        }
    }

    /// Ask the approval gate; on denial append the synthetic tool message
    /// and return `false`.
    async fn seek_approval(&mut self, call: &ToolCall) -> bool {
        self.events.emit(Event::ApprovalRequired {
            tool: call.name.clone(),
        });
        let rules = self.policy.approval_rules(&self.policy_context());
        let response = self.approval.request(call, &rules).await;
        self.events.emit(Event::ApprovalReceived {
            tool: call.name.clone(),
            approved: response.approved,
        });

        if !response.approved {
            let reason = response
                .reason
                .unwrap_or_else(|| "denied by approver".to_owned());
            self.append_tool_message(&call.id, format!("Tool call denied: {reason}"));
            self.events.emit(Event::ToolBlocked {
                tool: call.name.clone(),
                reason,
            });
            return false;
        }

        // Approved argument rewrites apply to the executed call.
        if let Some(args) = response.modified_args {
            self.pending_modified_args = Some((call.id.clone(), args));
        }
        true
    }

    /// The call as approved: original, or with approver-modified args.
    fn approved_call(&mut self, call: &ToolCall) -> ToolCall {
        match self.pending_modified_args.take() {
            Some((id, args)) if id == call.id => ToolCall {
                arguments: args,
                ..call.clone()
            },
            other => {
                self.pending_modified_args = other;
                call.clone()
            }
        }
    }

    async fn dispatch_parallel(&mut self, calls: &[ToolCall]) {
        for call in calls {
            self.events.emit(Event::ToolStart { call: call.clone() });
        }
        let outcomes: Vec<ExecuteOutcome> = join_all(
            calls
                .iter()
                .map(|call| self.execute_with_limits(&call.name, call.arguments.clone())),
        )
        .await;

        // Results append in original call order regardless of finish order.
        for (call, outcome) in calls.iter().zip(outcomes) {
            self.record_outcome(call, &outcome);
        }
    }

    async fn run_one(&mut self, call: &ToolCall) {
        self.events.emit(Event::ToolStart { call: call.clone() });
        let outcome = self
            .execute_with_limits(&call.name, call.arguments.clone())
            .await;
        self.record_outcome(call, &outcome);
    }

    fn record_outcome(&mut self, call: &ToolCall, outcome: &ExecuteOutcome) {
        self.append_tool_message(&call.id, outcome.output_text());
        self.events.emit(Event::ToolComplete {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            success: outcome.success,
        });
        if !outcome.success {
            // Tool failures are surfaced to the model, not fatal.
            self.events.emit(Event::ResilienceContinue {
                reason: format!("tool '{}' failed", call.name),
            });
        }
        let signals = self.governor.record_tool_call(call);
        self.emit_signals(&signals);
    }

    /// Execute a tool under the per-tool timeout, honoring the
    /// cancellation grace window.
    async fn execute_with_limits(&self, name: &str, args: Value) -> ExecuteOutcome {
        let execution = self.registry.execute(name, args);
        tokio::pin!(execution);
        let mut cancel_rx = self.cancel_rx.clone();

        tokio::select! {
            result = tokio::time::timeout(self.config.tool_timeout, &mut execution) => {
                result.unwrap_or_else(|_| {
                    ExecuteOutcome::error(format!(
                        "Tool '{name}' timed out after {:?}",
                        self.config.tool_timeout
                    ))
                })
            }
            _ = cancel_rx.changed() => {
                // In-flight tools get a grace window to finish.
                match tokio::time::timeout(self.config.cancel_grace, &mut execution).await {
                    Ok(outcome) => outcome,
                    Err(_) => ExecuteOutcome::error(
                        "tool abandoned after the cancellation grace period",
                    ),
                }
            }
        }
    }

    fn append_tool_message(&mut self, call_id: &str, content: String) {
        if let Err(err) = self
            .thread
            .context_mut()
            .append(Message::tool(call_id, content))
        {
            warn!(error = %err, call_id, "failed to append tool message");
        }
    }

    fn is_write_class(&self, name: &str) -> bool {
        if matches!(name, "write_file" | "edit_file" | "bash") {
            return true;
        }
        self.registry
            .definition(name)
            .is_some_and(|d| d.danger >= DangerLevel::Moderate)
    }

    /// Run and stream events as they happen; the final element is the
    /// `run.after` event carrying the terminal status.
    pub fn run_streamed<'a>(&'a mut self, task: &'a str) -> impl Stream<Item = Event> + 'a {
        let mut receiver = self.events.subscribe();
        async_stream::stream! {
            let run = self.run(task);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    _outcome = &mut run => {
                        while let Ok(event) = receiver.try_recv() {
                            let done = matches!(event, Event::RunAfter { .. });
                            yield event;
                            if done {
                                return;
                            }
                        }
                        return;
                    }
                    event = receiver.recv() => {
                        if let Ok(event) = event {
                            let done = matches!(event, Event::RunAfter { .. });
                            yield event;
                            if done {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// A terminal status under construction inside the LLM call path.
struct PendingStatus {
    success: bool,
    reason: CompletionReason,
    details: Option<String>,
}

impl PendingStatus {
    fn finish(self, recovery: &mut RecoveryInfo) -> CompletionStatus {
        let mut status =
            CompletionStatus::new(self.success, self.reason, std::mem::take(recovery));
        status.details = self.details;
        status
    }
}
