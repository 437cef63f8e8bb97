//! The governor: budget, progress, and phase fused into verdicts.
//!
//! Every iteration the scheduler asks the governor whether to continue.
//! The governor never stops the run itself — it produces a [`Verdict`]
//! carrying a suggested action and optional guidance prompt, and the
//! scheduler decides.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::budget::{
    Budget, BudgetDimension, BudgetLimits, DEFAULT_EXTENSION_FACTOR, ExtensionDecision,
    ExtensionHandler, ExtensionRequest,
};
use crate::message::ToolCall;
use crate::progress::{Phase, PhaseTracker, ProgressTracker};
use crate::prompts;
use crate::usage::Usage;

/// Consecutive stuck observations that trigger an extension request.
const STUCK_ESCALATION: u32 = 3;

/// What the governor suggests the scheduler do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    /// Proceed normally.
    Continue,
    /// Proceed, but guidance was injected.
    Warn,
    /// Ask the extension handler for more budget.
    RequestExtension,
    /// Terminate the run.
    Stop,
}

/// Structured output of one budget check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// Whether the loop may run another iteration.
    pub can_continue: bool,
    /// A hard limit has been crossed.
    pub is_hard_limit: bool,
    /// A soft limit has been crossed.
    pub is_soft_limit: bool,
    /// Fraction of the tightest hard limit consumed.
    pub percent_used: f64,
    /// Suggested scheduler action.
    pub suggested_action: SuggestedAction,
    /// The next turn must be text-only (no tools), used for the final
    /// summary turn after the iteration budget runs out.
    pub force_text_only: bool,
    /// Guidance to append as a system message before the next LLM call.
    pub injected_prompt: Option<String>,
    /// The dimension behind a limit verdict.
    pub budget_type: Option<BudgetDimension>,
    /// Human-readable explanation.
    pub reason: Option<String>,
}

impl Verdict {
    fn proceed(percent_used: f64) -> Self {
        Self {
            can_continue: true,
            is_hard_limit: false,
            is_soft_limit: false,
            percent_used,
            suggested_action: SuggestedAction::Continue,
            force_text_only: false,
            injected_prompt: None,
            budget_type: None,
            reason: None,
        }
    }
}

/// Edge events surfaced by governor bookkeeping; the scheduler converts
/// these into stream events.
#[derive(Debug, Clone)]
pub enum GovernorSignal {
    /// A doom loop was detected (rising edge).
    DoomLoop {
        /// The repeated tool.
        tool: String,
        /// Consecutive identical calls observed.
        count: usize,
    },
    /// The phase machine transitioned.
    PhaseTransition {
        /// Previous phase.
        from: Phase,
        /// New phase.
        to: Phase,
    },
    /// Exploration saturated (rising edge).
    ExplorationSaturation {
        /// Unique files read.
        files_read: usize,
        /// Iterations spent exploring.
        iterations: u64,
    },
    /// Meaningful progress was made.
    ProgressMade,
    /// The stuck heuristic fired.
    Stuck {
        /// Consecutive stuck observations.
        count: u32,
    },
}

/// Budget + progress + phase, producing verdicts and guidance.
pub struct Governor {
    budget: Budget,
    progress: ProgressTracker,
    phase: PhaseTracker,
    extension_handler: Option<Arc<dyn ExtensionHandler>>,
    /// Dimensions whose extension was already denied; asking again would
    /// spam the host.
    denied_extensions: Vec<BudgetDimension>,
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("usage", &self.budget.usage())
            .field("phase", &self.phase.phase())
            .finish_non_exhaustive()
    }
}

impl Governor {
    /// Create a governor over the given limits.
    #[must_use]
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            budget: Budget::new(limits),
            progress: ProgressTracker::new(),
            phase: PhaseTracker::new(),
            extension_handler: None,
            denied_extensions: Vec::new(),
        }
    }

    /// Attach a host extension handler.
    #[must_use]
    pub fn with_extension_handler(mut self, handler: Arc<dyn ExtensionHandler>) -> Self {
        self.extension_handler = Some(handler);
        self
    }

    /// Current usage snapshot.
    #[must_use]
    pub fn usage(&self) -> Usage {
        self.budget.usage()
    }

    /// The budget (for limit inspection).
    #[must_use]
    pub const fn budget(&self) -> &Budget {
        &self.budget
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase.phase()
    }

    /// The progress tracker (for inspection).
    #[must_use]
    pub const fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Record one LLM call's usage.
    pub fn record_llm_usage(
        &mut self,
        input_tokens: u64,
        output_tokens: u64,
        model: &str,
        actual_cost: Option<f64>,
    ) {
        self.budget
            .record_llm_usage(input_tokens, output_tokens, model, actual_cost);
    }

    /// Count one completed loop iteration.
    pub const fn record_iteration(&mut self) {
        self.budget.record_iteration();
        self.phase.record_iteration();
    }

    /// Record one dispatched tool call, driving progress and phase state.
    pub fn record_tool_call(&mut self, call: &ToolCall) -> Vec<GovernorSignal> {
        self.budget.record_tool_call();
        let usage = self.budget.usage();

        let mut signals = Vec::new();

        let progress = self.progress.record(call, usage.duration, usage.iterations);
        if progress.doom_loop_detected {
            signals.push(GovernorSignal::DoomLoop {
                tool: call.name.clone(),
                count: self.progress.loop_state().consecutive_count,
            });
        }
        if progress.progress_made {
            signals.push(GovernorSignal::ProgressMade);
        }

        let phase = self.phase.observe(&call.name, &call.arguments);
        if let Some((from, to)) = phase.transition {
            signals.push(GovernorSignal::PhaseTransition { from, to });
        }
        if phase.saturation {
            signals.push(GovernorSignal::ExplorationSaturation {
                files_read: self.phase.unique_files_read(),
                iterations: self.phase.iterations_in_phase(),
            });
        }

        signals
    }

    /// Pause wall-clock accounting (used while a subagent runs).
    pub fn pause_duration(&mut self) {
        self.budget.pause_duration();
    }

    /// Resume wall-clock accounting.
    pub fn resume_duration(&mut self) {
        self.budget.resume_duration();
    }

    /// Reset per-run state: usage, progress, phase. Limits survive.
    pub fn reset(&mut self) {
        self.budget.reset();
        self.progress.reset();
        self.phase.reset();
        self.denied_extensions.clear();
    }

    /// Produce a verdict for the next iteration.
    ///
    /// Priority order: hard limits, iteration exhaustion, doom loop,
    /// exploration saturation, soft limits, stuckness, continue.
    pub fn check(&mut self) -> (Verdict, Vec<GovernorSignal>) {
        let percent_used = self.budget.percent_used();
        let usage = self.budget.usage();
        let mut signals = Vec::new();

        // 1. Hard token/cost/duration limits force a stop.
        if let Some(hit) = self.budget.hard_limit_hit() {
            let verdict = Verdict {
                can_continue: false,
                is_hard_limit: true,
                is_soft_limit: false,
                percent_used: hit.percent_used,
                suggested_action: SuggestedAction::Stop,
                force_text_only: false,
                injected_prompt: None,
                budget_type: Some(hit.dimension),
                reason: Some(hit.detail),
            };
            return (verdict, signals);
        }

        // 2. Iteration exhaustion allows exactly one text-only summary turn.
        if self.budget.iterations_exhausted() {
            let verdict = Verdict {
                can_continue: true,
                is_hard_limit: true,
                is_soft_limit: false,
                percent_used,
                suggested_action: SuggestedAction::Stop,
                force_text_only: true,
                injected_prompt: Some(prompts::MAX_STEPS_PROMPT.to_owned()),
                budget_type: Some(BudgetDimension::Iterations),
                reason: Some(format!(
                    "Iteration budget exhausted after {} iterations",
                    usage.iterations
                )),
            };
            return (verdict, signals);
        }

        // 3. Doom loop: keep nudging while the condition persists.
        let loop_state = self.progress.loop_state();
        if loop_state.doom_loop_detected {
            let tool = loop_state.last_tool.clone().unwrap_or_default();
            let count = loop_state.consecutive_count;
            let verdict = Verdict {
                can_continue: true,
                is_hard_limit: false,
                is_soft_limit: false,
                percent_used,
                suggested_action: SuggestedAction::Warn,
                force_text_only: false,
                injected_prompt: Some(prompts::doom_loop(&tool, count)),
                budget_type: None,
                reason: Some(format!("doom loop on '{tool}'")),
            };
            return (verdict, signals);
        }

        // 4. Exploration saturation.
        if self.phase.phase() == Phase::Exploring && self.phase.should_transition() {
            let verdict = Verdict {
                can_continue: true,
                is_hard_limit: false,
                is_soft_limit: false,
                percent_used,
                suggested_action: SuggestedAction::Warn,
                force_text_only: false,
                injected_prompt: Some(prompts::exploration_nudge(
                    self.phase.unique_files_read(),
                    self.phase.iterations_in_phase(),
                )),
                budget_type: None,
                reason: Some("exploration saturated without modification".to_owned()),
            };
            return (verdict, signals);
        }

        // 5. Soft token/cost/duration limits request an extension.
        if let Some(hit) = self.budget.soft_limit_hit()
            && !self.denied_extensions.contains(&hit.dimension)
        {
            let verdict = Verdict {
                can_continue: true,
                is_hard_limit: false,
                is_soft_limit: true,
                percent_used: hit.percent_used,
                suggested_action: SuggestedAction::RequestExtension,
                force_text_only: false,
                injected_prompt: Some(prompts::soft_budget_wrap_up(
                    &hit.dimension.to_string(),
                    hit.threshold_fraction,
                )),
                budget_type: Some(hit.dimension),
                reason: Some(hit.detail),
            };
            return (verdict, signals);
        }

        // 6. Stuckness escalates to an extension request after repeats.
        if self.progress.check_stuck(usage.duration, usage.iterations) {
            let count = self.progress.stuck_count();
            signals.push(GovernorSignal::Stuck { count });
            if count >= STUCK_ESCALATION {
                let verdict = Verdict {
                    can_continue: true,
                    is_hard_limit: false,
                    is_soft_limit: false,
                    percent_used,
                    suggested_action: SuggestedAction::RequestExtension,
                    force_text_only: false,
                    injected_prompt: None,
                    budget_type: None,
                    reason: Some("no progress".to_owned()),
                };
                return (verdict, signals);
            }
        }

        // 7. Carry on.
        (Verdict::proceed(percent_used), signals)
    }

    /// Ask the host for a budget extension.
    ///
    /// On grant, the exceeded dimension's limits are multiplied by the
    /// handler's factor (default 1.5). A denial is remembered so the same
    /// dimension is not re-requested.
    pub async fn request_extension(
        &mut self,
        reason: &str,
        dimension: BudgetDimension,
    ) -> ExtensionDecision {
        let request = ExtensionRequest {
            reason: reason.to_owned(),
            dimension,
            percent_used: self.budget.percent_used(),
        };

        let decision = match &self.extension_handler {
            Some(handler) => handler.request(&request).await,
            None => ExtensionDecision {
                granted: false,
                factor: None,
            },
        };

        if decision.granted {
            let factor = decision.factor.unwrap_or(DEFAULT_EXTENSION_FACTOR);
            self.budget.extend(dimension, factor);
        } else if !self.denied_extensions.contains(&dimension) {
            self.denied_extensions.push(dimension);
        }
        decision
    }
}
