//! Running usage totals for an agent run.
//!
//! [`Usage`] accumulates every budget dimension the governor cares about:
//! tokens, dollar cost, effective wall-clock duration, iterations, and call
//! counts. All counters are additive and non-decreasing within a run;
//! `reset` is the only way back to zero.

use std::ops::{Add, AddAssign};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Running totals for one agent run.
///
/// Invariant: `tokens() == input_tokens + output_tokens`. The derived total
/// is a method rather than a stored field so the invariant cannot drift.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens sent to the model.
    pub input_tokens: u64,
    /// Tokens generated by the model.
    pub output_tokens: u64,
    /// Tokens served from the provider's prompt cache.
    pub cached_tokens: u64,
    /// Accumulated cost in dollars.
    pub cost: f64,
    /// Effective duration (paused spans excluded).
    pub duration: Duration,
    /// Completed loop iterations.
    pub iterations: u64,
    /// Dispatched tool calls.
    pub tool_calls: u64,
    /// Completed LLM calls.
    pub llm_calls: u64,
}

impl Usage {
    /// An empty usage record.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            cached_tokens: 0,
            cost: 0.0,
            duration: Duration::ZERO,
            iterations: 0,
            tool_calls: 0,
            llm_calls: 0,
        }
    }

    /// Total tokens (input + output).
    #[must_use]
    pub const fn tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Whether nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens() == 0 && self.iterations == 0 && self.tool_calls == 0 && self.llm_calls == 0
    }

    /// Record one LLM call's token counts and cost.
    pub fn record_llm(&mut self, input_tokens: u64, output_tokens: u64, cost: f64) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.cost += cost;
        self.llm_calls += 1;
    }

    /// Record one dispatched tool call.
    pub const fn record_tool_call(&mut self) {
        self.tool_calls += 1;
    }

    /// Record one completed iteration.
    pub const fn record_iteration(&mut self) {
        self.iterations += 1;
    }

    /// Clear all counters.
    pub fn reset(&mut self) {
        *self = Self::zero();
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            cached_tokens: self.cached_tokens + rhs.cached_tokens,
            cost: self.cost + rhs.cost,
            duration: self.duration + rhs.duration,
            iterations: self.iterations + rhs.iterations,
            tool_calls: self.tool_calls + rhs.tool_calls,
            llm_calls: self.llm_calls + rhs.llm_calls,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::fmt::Display for Usage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Usage(tokens: {} in / {} out, cost: ${:.4}, iterations: {}, tools: {}, llm: {})",
            self.input_tokens,
            self.output_tokens,
            self.cost,
            self.iterations,
            self.tool_calls,
            self.llm_calls,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_empty() {
        assert!(Usage::zero().is_empty());
        assert_eq!(Usage::zero().tokens(), 0);
    }

    #[test]
    fn tokens_is_sum_of_parts() {
        let mut usage = Usage::zero();
        usage.record_llm(70, 15, 0.01);
        assert_eq!(usage.tokens(), 85);
        usage.record_llm(30, 10, 0.01);
        assert_eq!(usage.tokens(), 125);
        assert_eq!(usage.llm_calls, 2);
    }

    #[test]
    fn counters_are_monotonic() {
        // Every counter is non-decreasing across arbitrary operations.
        let mut usage = Usage::zero();
        let mut last = usage;
        for i in 0..20u64 {
            match i % 3 {
                0 => usage.record_llm(i, i / 2, 0.001),
                1 => usage.record_tool_call(),
                _ => usage.record_iteration(),
            }
            assert!(usage.tokens() >= last.tokens());
            assert!(usage.cost >= last.cost);
            assert!(usage.tool_calls >= last.tool_calls);
            assert!(usage.llm_calls >= last.llm_calls);
            assert!(usage.iterations >= last.iterations);
            last = usage;
        }
    }

    #[test]
    fn reset_clears_everything() {
        let mut usage = Usage::zero();
        usage.record_llm(100, 50, 0.5);
        usage.record_tool_call();
        usage.record_iteration();
        usage.duration = Duration::from_secs(5);
        usage.reset();
        assert!(usage.is_empty());
        assert_eq!(usage.duration, Duration::ZERO);
    }

    #[test]
    fn add_sums_fieldwise() {
        let mut a = Usage::zero();
        a.record_llm(100, 50, 0.25);
        let mut b = Usage::zero();
        b.record_llm(10, 5, 0.05);
        b.record_tool_call();

        let c = a + b;
        assert_eq!(c.input_tokens, 110);
        assert_eq!(c.output_tokens, 55);
        assert!((c.cost - 0.30).abs() < 1e-9);
        assert_eq!(c.tool_calls, 1);
        assert_eq!(c.llm_calls, 2);
    }

    #[test]
    fn serde_roundtrip() {
        let mut usage = Usage::zero();
        usage.record_llm(100, 50, 0.1);
        usage.duration = Duration::from_millis(1500);
        let json = serde_json::to_string(&usage).unwrap();
        let parsed: Usage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, usage);
    }
}
