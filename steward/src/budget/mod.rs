//! Budget limits, presets, and usage accounting.
//!
//! A [`Budget`] owns the run's [`Usage`] counters, the pausable clock, and
//! a two-tier limit per dimension: a **hard** limit that forces a stop and
//! a **soft** limit that triggers a warning or extension request. Budget
//! checks never fail the run by themselves — they feed the governor, and
//! the scheduler decides.

mod clock;
mod pricing;

pub use clock::PausableClock;
pub use pricing::cost_for;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::usage::Usage;

/// A budgeted resource dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    /// Total tokens (input + output).
    Tokens,
    /// Dollar cost.
    Cost,
    /// Effective wall-clock duration.
    Duration,
    /// Loop iterations.
    Iterations,
}

impl std::fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Tokens => "tokens",
            Self::Cost => "cost",
            Self::Duration => "duration",
            Self::Iterations => "iterations",
        };
        f.write_str(s)
    }
}

/// Two-tier limits per dimension. `None` means unlimited.
///
/// Invariant: for every dimension, soft ≤ hard. The builder clamps soft
/// limits down to the hard limit rather than erroring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// Hard token limit.
    pub max_tokens: Option<u64>,
    /// Soft token limit.
    pub soft_token_limit: Option<u64>,
    /// Hard cost limit in dollars.
    pub max_cost: Option<f64>,
    /// Soft cost limit in dollars.
    pub soft_cost_limit: Option<f64>,
    /// Hard duration limit.
    pub max_duration: Option<Duration>,
    /// Soft duration limit.
    pub soft_duration_limit: Option<Duration>,
    /// Hard iteration limit.
    pub max_iterations: Option<u64>,
    /// Advisory iteration target; never enforced.
    pub target_iterations: Option<u64>,
}

impl BudgetLimits {
    /// No limits at all.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            max_tokens: None,
            soft_token_limit: None,
            max_cost: None,
            soft_cost_limit: None,
            max_duration: None,
            soft_duration_limit: None,
            max_iterations: None,
            target_iterations: None,
        }
    }

    /// Quick interactive preset: 50k tokens, $0.10, 60 s.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            max_tokens: Some(50_000),
            max_cost: Some(0.10),
            max_duration: Some(Duration::from_secs(60)),
            ..Self::unlimited()
        }
        .normalized()
    }

    /// Standard preset: 200k tokens, $0.50, 10 min.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            max_tokens: Some(200_000),
            max_cost: Some(0.50),
            max_duration: Some(Duration::from_secs(600)),
            ..Self::unlimited()
        }
        .normalized()
    }

    /// Subagent preset: 150k tokens (soft 100k), $0.50, 6 min (soft 5 min).
    #[must_use]
    pub fn subagent() -> Self {
        Self {
            max_tokens: Some(150_000),
            soft_token_limit: Some(100_000),
            max_cost: Some(0.50),
            max_duration: Some(Duration::from_secs(360)),
            soft_duration_limit: Some(Duration::from_secs(300)),
            ..Self::unlimited()
        }
        .normalized()
    }

    /// Large preset: 500k tokens, $2.00, 15 min.
    #[must_use]
    pub fn large() -> Self {
        Self {
            max_tokens: Some(500_000),
            max_cost: Some(2.00),
            max_duration: Some(Duration::from_secs(900)),
            ..Self::unlimited()
        }
        .normalized()
    }

    /// Set the hard token limit.
    #[must_use]
    pub const fn with_max_tokens(mut self, max: u64) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Set the soft token limit.
    #[must_use]
    pub const fn with_soft_token_limit(mut self, soft: u64) -> Self {
        self.soft_token_limit = Some(soft);
        self
    }

    /// Set the hard cost limit.
    #[must_use]
    pub const fn with_max_cost(mut self, max: f64) -> Self {
        self.max_cost = Some(max);
        self
    }

    /// Set the soft cost limit.
    #[must_use]
    pub const fn with_soft_cost_limit(mut self, soft: f64) -> Self {
        self.soft_cost_limit = Some(soft);
        self
    }

    /// Set the hard duration limit.
    #[must_use]
    pub const fn with_max_duration(mut self, max: Duration) -> Self {
        self.max_duration = Some(max);
        self
    }

    /// Set the hard iteration limit.
    #[must_use]
    pub const fn with_max_iterations(mut self, max: u64) -> Self {
        self.max_iterations = Some(max);
        self
    }

    /// Set the advisory iteration target.
    #[must_use]
    pub const fn with_target_iterations(mut self, target: u64) -> Self {
        self.target_iterations = Some(target);
        self
    }

    /// Clamp soft limits to their hard counterparts.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if let (Some(soft), Some(hard)) = (self.soft_token_limit, self.max_tokens)
            && soft > hard
        {
            self.soft_token_limit = Some(hard);
        }
        if let (Some(soft), Some(hard)) = (self.soft_cost_limit, self.max_cost)
            && soft > hard
        {
            self.soft_cost_limit = Some(hard);
        }
        if let (Some(soft), Some(hard)) = (self.soft_duration_limit, self.max_duration)
            && soft > hard
        {
            self.soft_duration_limit = Some(hard);
        }
        debug_assert!(self.soft_token_limit.zip(self.max_tokens).is_none_or(|(s, h)| s <= h));
        self
    }

    /// Multiply the limits of one dimension by `factor` (extension grant).
    pub fn extend(&mut self, dimension: BudgetDimension, factor: f64) {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let scale = |v: u64| -> u64 { ((v as f64) * factor) as u64 };

        match dimension {
            BudgetDimension::Tokens => {
                self.max_tokens = self.max_tokens.map(scale);
                self.soft_token_limit = self.soft_token_limit.map(scale);
            }
            BudgetDimension::Cost => {
                self.max_cost = self.max_cost.map(|v| v * factor);
                self.soft_cost_limit = self.soft_cost_limit.map(|v| v * factor);
            }
            BudgetDimension::Duration => {
                self.max_duration = self.max_duration.map(|v| v.mul_f64(factor));
                self.soft_duration_limit = self.soft_duration_limit.map(|v| v.mul_f64(factor));
            }
            BudgetDimension::Iterations => {
                self.max_iterations = self.max_iterations.map(scale);
            }
        }
    }
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self::standard()
    }
}

/// A request to extend an exhausted soft limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionRequest {
    /// Why the extension is needed.
    pub reason: String,
    /// Which dimension is exhausted.
    pub dimension: BudgetDimension,
    /// How much of the hard limit is already used (0.0–1.0+).
    pub percent_used: f64,
}

/// Host decision on an extension request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExtensionDecision {
    /// Whether the extension is granted.
    pub granted: bool,
    /// Limit multiplier to apply; defaults to 1.5 when absent.
    pub factor: Option<f64>,
}

/// Host-supplied extension policy.
#[async_trait]
pub trait ExtensionHandler: Send + Sync {
    /// Decide whether to grant an extension.
    async fn request(&self, request: &ExtensionRequest) -> ExtensionDecision;
}

/// Default multiplier applied on an extension grant.
pub const DEFAULT_EXTENSION_FACTOR: f64 = 1.5;

/// Which limit tier a dimension has crossed.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitHit {
    /// The crossed dimension.
    pub dimension: BudgetDimension,
    /// Fraction of the hard limit consumed.
    pub percent_used: f64,
    /// The crossed threshold as a fraction of the hard limit (soft/hard
    /// for soft hits, 1.0 for hard hits).
    pub threshold_fraction: f64,
    /// Human-readable description for events and completion status.
    pub detail: String,
}

/// Budget state for one run.
#[derive(Debug)]
pub struct Budget {
    limits: BudgetLimits,
    usage: Usage,
    clock: PausableClock,
}

impl Budget {
    /// Create a budget from limits, starting the clock now.
    #[must_use]
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits: limits.normalized(),
            usage: Usage::zero(),
            clock: PausableClock::start(),
        }
    }

    /// Current limits.
    #[must_use]
    pub const fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    /// Usage snapshot with the duration refreshed from the clock.
    #[must_use]
    pub fn usage(&self) -> Usage {
        let mut usage = self.usage;
        usage.duration = self.clock.effective_elapsed();
        usage
    }

    /// Record one LLM call.
    ///
    /// If the provider reported a cost it is authoritative; otherwise the
    /// pricing table is consulted, and an unknown model costs zero with a
    /// warning rather than failing.
    pub fn record_llm_usage(
        &mut self,
        input_tokens: u64,
        output_tokens: u64,
        model: &str,
        actual_cost: Option<f64>,
    ) {
        let cost = actual_cost.or_else(|| cost_for(model, input_tokens, output_tokens));
        let cost = cost.unwrap_or_else(|| {
            warn!(model, "no pricing entry for model; recording zero cost");
            0.0
        });
        self.usage.record_llm(input_tokens, output_tokens, cost);
    }

    /// Record one dispatched tool call.
    pub const fn record_tool_call(&mut self) {
        self.usage.record_tool_call();
    }

    /// Record one completed iteration.
    pub const fn record_iteration(&mut self) {
        self.usage.record_iteration();
    }

    /// Pause wall-clock accounting (stack-safe).
    pub fn pause_duration(&mut self) {
        self.clock.pause();
    }

    /// Resume wall-clock accounting.
    pub fn resume_duration(&mut self) {
        self.clock.resume();
    }

    /// Reset usage and restart the clock; limits are untouched.
    pub fn reset(&mut self) {
        self.usage.reset();
        self.clock.reset();
    }

    /// Apply an extension grant to one dimension.
    pub fn extend(&mut self, dimension: BudgetDimension, factor: f64) {
        self.limits.extend(dimension, factor);
    }

    /// Fraction of the tightest hard limit consumed (0.0–1.0+).
    #[must_use]
    pub fn percent_used(&self) -> f64 {
        let usage = self.usage();
        let mut worst: f64 = 0.0;

        #[allow(clippy::cast_precision_loss)]
        {
            if let Some(max) = self.limits.max_tokens {
                worst = worst.max(usage.tokens() as f64 / max.max(1) as f64);
            }
            if let Some(max) = self.limits.max_cost
                && max > 0.0
            {
                worst = worst.max(usage.cost / max);
            }
            if let Some(max) = self.limits.max_duration
                && !max.is_zero()
            {
                worst = worst.max(usage.duration.as_secs_f64() / max.as_secs_f64());
            }
            if let Some(max) = self.limits.max_iterations {
                worst = worst.max(usage.iterations as f64 / max.max(1) as f64);
            }
        }
        worst
    }

    /// The first hard limit that has been crossed, in check order
    /// tokens → cost → duration. Iterations are handled separately by the
    /// governor because they allow one final summary turn.
    #[must_use]
    pub fn hard_limit_hit(&self) -> Option<LimitHit> {
        let usage = self.usage();

        if let Some(max) = self.limits.max_tokens
            && usage.tokens() >= max
        {
            return Some(LimitHit {
                dimension: BudgetDimension::Tokens,
                percent_used: self.percent_used(),
                threshold_fraction: 1.0,
                detail: format!("Token budget exceeded: {} / {max}", usage.tokens()),
            });
        }
        if let Some(max) = self.limits.max_cost
            && usage.cost >= max
        {
            return Some(LimitHit {
                dimension: BudgetDimension::Cost,
                percent_used: self.percent_used(),
                threshold_fraction: 1.0,
                detail: format!("Cost budget exceeded: ${:.4} / ${max:.2}", usage.cost),
            });
        }
        if let Some(max) = self.limits.max_duration
            && usage.duration >= max
        {
            return Some(LimitHit {
                dimension: BudgetDimension::Duration,
                percent_used: self.percent_used(),
                threshold_fraction: 1.0,
                detail: format!(
                    "Duration budget exceeded: {:.1}s / {:.1}s",
                    usage.duration.as_secs_f64(),
                    max.as_secs_f64()
                ),
            });
        }
        None
    }

    /// The first soft limit crossed (tokens, then cost, then duration),
    /// when no hard limit is.
    #[must_use]
    pub fn soft_limit_hit(&self) -> Option<LimitHit> {
        let usage = self.usage();

        #[allow(clippy::cast_precision_loss)]
        if let Some(soft) = self.limits.soft_token_limit
            && usage.tokens() >= soft
        {
            let percent = self
                .limits
                .max_tokens
                .map_or(1.0, |max| usage.tokens() as f64 / max.max(1) as f64);
            let threshold = self
                .limits
                .max_tokens
                .map_or(1.0, |max| soft as f64 / max.max(1) as f64);
            return Some(LimitHit {
                dimension: BudgetDimension::Tokens,
                percent_used: percent,
                threshold_fraction: threshold,
                detail: format!("Soft token limit reached: {} / {soft}", usage.tokens()),
            });
        }
        if let Some(soft) = self.limits.soft_cost_limit
            && usage.cost >= soft
        {
            let percent = self.limits.max_cost.map_or(1.0, |max| usage.cost / max);
            let threshold = self.limits.max_cost.map_or(1.0, |max| soft / max);
            return Some(LimitHit {
                dimension: BudgetDimension::Cost,
                percent_used: percent,
                threshold_fraction: threshold,
                detail: format!("Soft cost limit reached: ${:.4} / ${soft:.2}", usage.cost),
            });
        }
        if let Some(soft) = self.limits.soft_duration_limit
            && usage.duration >= soft
        {
            let percent = self
                .limits
                .max_duration
                .map_or(1.0, |max| usage.duration.as_secs_f64() / max.as_secs_f64());
            let threshold = self
                .limits
                .max_duration
                .map_or(1.0, |max| soft.as_secs_f64() / max.as_secs_f64());
            return Some(LimitHit {
                dimension: BudgetDimension::Duration,
                percent_used: percent,
                threshold_fraction: threshold,
                detail: format!(
                    "Soft duration limit reached: {:.1}s / {:.1}s",
                    usage.duration.as_secs_f64(),
                    soft.as_secs_f64()
                ),
            });
        }
        None
    }

    /// Whether the iteration hard limit has been reached.
    #[must_use]
    pub fn iterations_exhausted(&self) -> bool {
        self.limits
            .max_iterations
            .is_some_and(|max| self.usage.iterations >= max)
    }
}

impl Default for Budget {
    fn default() -> Self {
        Self::new(BudgetLimits::standard())
    }
}
