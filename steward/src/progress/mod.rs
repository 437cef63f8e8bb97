//! Progress heuristics: doom-loop, stuckness, and activity tracking.
//!
//! The tracker observes every dispatched tool call and answers two
//! questions for the governor: is the agent repeating itself (doom loop),
//! and is it making meaningful progress at all (stuckness). Detection is
//! edge-triggered so a persisting condition produces one signal, not a
//! signal per call.

pub mod phase;

pub use phase::{Phase, PhaseTracker, PhaseUpdate};

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;

use crate::message::{ToolCall, canonical_json};

/// Capacity of the recent-calls ring buffer.
///
/// A bounded ring rather than an unbounded list: long runs must not grow
/// memory with call count.
pub const RECENT_CALLS_CAP: usize = 10;

/// Consecutive identical calls that constitute a doom loop.
pub const DEFAULT_DOOM_THRESHOLD: usize = 3;

/// Effective time without meaningful progress that counts as stuck.
const STUCK_AFTER: Duration = Duration::from_secs(60);

/// Iterations that must have elapsed before time-based stuckness applies.
const STUCK_MIN_ITERATIONS: u64 = 5;

/// One entry in the recent-calls ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentCall {
    /// Tool name.
    pub tool: String,
    /// Canonically serialized arguments.
    pub stable_args: String,
    /// Effective elapsed time when the call was recorded.
    pub at: Duration,
}

impl RecentCall {
    fn key(&self) -> (&str, &str) {
        (&self.tool, &self.stable_args)
    }
}

/// Consecutive-call tracking for doom-loop detection.
#[derive(Debug, Clone)]
pub struct LoopState {
    /// Whether a doom loop is currently in effect.
    pub doom_loop_detected: bool,
    /// Last observed tool name.
    pub last_tool: Option<String>,
    /// Consecutive identical `(tool, args)` observations.
    pub consecutive_count: usize,
    /// Detection threshold.
    pub threshold: usize,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            doom_loop_detected: false,
            last_tool: None,
            consecutive_count: 0,
            threshold: DEFAULT_DOOM_THRESHOLD,
        }
    }
}

/// Edge signals produced by recording one tool call.
#[derive(Debug, Clone, Default)]
pub struct ProgressSignals {
    /// A doom loop was detected on this call (rising edge only).
    pub doom_loop_detected: bool,
    /// This call made meaningful progress.
    pub progress_made: bool,
}

/// Observes tool calls and detects repetition and stalls.
#[derive(Debug)]
pub struct ProgressTracker {
    files_read: BTreeSet<String>,
    files_modified: BTreeSet<String>,
    commands_run: Vec<String>,
    recent: VecDeque<RecentCall>,
    loop_state: LoopState,
    last_meaningful_progress: Duration,
    stuck_count: u32,
    last_args: Option<String>,
}

impl ProgressTracker {
    /// Create a tracker with the default doom-loop threshold.
    #[must_use]
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_DOOM_THRESHOLD)
    }

    /// Create a tracker with a custom doom-loop threshold.
    #[must_use]
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            files_read: BTreeSet::new(),
            files_modified: BTreeSet::new(),
            commands_run: Vec::new(),
            recent: VecDeque::with_capacity(RECENT_CALLS_CAP),
            loop_state: LoopState {
                threshold: threshold.max(2),
                ..LoopState::default()
            },
            last_meaningful_progress: Duration::ZERO,
            stuck_count: 0,
            last_args: None,
        }
    }

    /// Current loop state.
    #[must_use]
    pub const fn loop_state(&self) -> &LoopState {
        &self.loop_state
    }

    /// Distinct files read so far.
    #[must_use]
    pub fn files_read(&self) -> usize {
        self.files_read.len()
    }

    /// Distinct files modified so far.
    #[must_use]
    pub fn files_modified(&self) -> usize {
        self.files_modified.len()
    }

    /// Commands run so far.
    #[must_use]
    pub fn commands_run(&self) -> &[String] {
        &self.commands_run
    }

    /// Times the stuck heuristic has fired without intervening progress.
    #[must_use]
    pub const fn stuck_count(&self) -> u32 {
        self.stuck_count
    }

    /// Snapshot of the recent-calls ring, oldest first.
    #[must_use]
    pub fn recent_calls(&self) -> Vec<RecentCall> {
        self.recent.iter().cloned().collect()
    }

    /// Record one dispatched tool call.
    ///
    /// `now` is the budget clock's effective elapsed time and `iteration`
    /// the current iteration count; both feed the stuckness heuristics.
    pub fn record(&mut self, call: &ToolCall, now: Duration, iteration: u64) -> ProgressSignals {
        let stable_args = canonical_json(&call.arguments);
        let mut signals = ProgressSignals::default();

        // Ring buffer append, bounded.
        self.recent.push_back(RecentCall {
            tool: call.name.clone(),
            stable_args: stable_args.clone(),
            at: now,
        });
        while self.recent.len() > RECENT_CALLS_CAP {
            self.recent.pop_front();
        }

        // Consecutive-identical tracking with edge-triggered detection.
        let same = self.loop_state.last_tool.as_deref() == Some(call.name.as_str())
            && self.last_args.as_deref() == Some(stable_args.as_str());
        if same {
            self.loop_state.consecutive_count += 1;
        } else {
            self.loop_state.consecutive_count = 1;
            self.loop_state.doom_loop_detected = false;
        }
        self.loop_state.last_tool = Some(call.name.clone());
        self.last_args = Some(stable_args);

        if self.loop_state.consecutive_count >= self.loop_state.threshold
            && !self.loop_state.doom_loop_detected
        {
            self.loop_state.doom_loop_detected = true;
            signals.doom_loop_detected = true;
        }

        // Activity tracking and meaningful-progress detection.
        if let Some(path) = path_argument(&call.arguments) {
            match classify(&call.name) {
                ToolKind::Read => {
                    let new = self.files_read.insert(path);
                    if new && iteration <= STUCK_MIN_ITERATIONS {
                        signals.progress_made = true;
                    }
                }
                ToolKind::Write => {
                    if self.files_modified.insert(path) {
                        signals.progress_made = true;
                    }
                }
                ToolKind::Command | ToolKind::Other => {}
            }
        }
        if classify(&call.name) == ToolKind::Command
            && let Some(cmd) = command_argument(&call.arguments)
        {
            if !self.commands_run.contains(&cmd) {
                signals.progress_made = true;
            }
            self.commands_run.push(cmd);
        }

        if signals.progress_made {
            self.last_meaningful_progress = now;
            self.stuck_count = 0;
        }

        signals
    }

    /// Evaluate the stuckness heuristic at `now`.
    ///
    /// True when the last three recent calls are identical, or when more
    /// than 60 s of effective time has passed since the last meaningful
    /// progress with at least five iterations behind us. Each positive
    /// observation increments `stuck_count`.
    pub fn check_stuck(&mut self, now: Duration, iterations: u64) -> bool {
        let tail_identical = self.recent.len() >= 3 && {
            let mut iter = self.recent.iter().rev();
            let last = iter.next();
            last.is_some_and(|last| iter.take(2).filter(|c| c.key() == last.key()).count() == 2)
        };

        let timed_out = now.saturating_sub(self.last_meaningful_progress) > STUCK_AFTER
            && iterations >= STUCK_MIN_ITERATIONS;

        let stuck = tail_identical || timed_out;
        if stuck {
            self.stuck_count += 1;
        }
        stuck
    }

    /// Clear all tracked state.
    pub fn reset(&mut self) {
        *self = Self::with_threshold(self.loop_state.threshold);
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ToolKind {
    Read,
    Write,
    Command,
    Other,
}

fn classify(tool: &str) -> ToolKind {
    match tool {
        "read_file" => ToolKind::Read,
        "write_file" | "edit_file" => ToolKind::Write,
        "bash" => ToolKind::Command,
        _ => ToolKind::Other,
    }
}

fn path_argument(args: &Value) -> Option<String> {
    for key in ["path", "file_path", "file"] {
        if let Some(path) = args.get(key).and_then(Value::as_str) {
            return Some(path.to_owned());
        }
    }
    None
}

fn command_argument(args: &Value) -> Option<String> {
    for key in ["command", "cmd"] {
        if let Some(cmd) = args.get(key).and_then(Value::as_str) {
            return Some(cmd.to_owned());
        }
    }
    None
}
