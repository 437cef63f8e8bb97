//! Coarse agent phase derived from tool-use patterns.
//!
//! The phase machine watches the same tool stream as the progress tracker
//! and classifies the run as exploring, planning, acting, or verifying.
//! The governor uses the exploring phase's saturation signal to nudge an
//! agent that reads forever without writing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Files that must be read in `exploring` before saturation can trigger.
const SATURATION_FILES: usize = 10;

/// Iterations in phase after which low discovery triggers saturation.
const SATURATION_ITERATIONS: u64 = 5;

/// Coarse agent state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Reading and searching the workspace.
    #[default]
    Exploring,
    /// Organizing an approach.
    Planning,
    /// Making modifications.
    Acting,
    /// Running tests against modifications.
    Verifying,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Exploring => "exploring",
            Self::Planning => "planning",
            Self::Acting => "acting",
            Self::Verifying => "verifying",
        };
        f.write_str(s)
    }
}

/// Edge signals from one phase observation.
#[derive(Debug, Clone, Default)]
pub struct PhaseUpdate {
    /// A transition happened on this observation.
    pub transition: Option<(Phase, Phase)>,
    /// Exploration saturation was detected (rising edge only).
    pub saturation: bool,
}

fn test_command_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"\b(?:cargo\s+test|pytest|npm\s+test|jest|go\s+test)\b|\btest\b").unwrap()
    })
}

/// Phase state machine.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: Phase,
    iterations_in_phase: u64,
    unique_files_read: BTreeSet<String>,
    unique_searches: BTreeSet<String>,
    files_modified: BTreeSet<String>,
    tests_run: u64,
    should_transition: bool,
    recent_new_files: u64,
    saturation_emitted: bool,
}

impl PhaseTracker {
    /// Create a tracker in the `exploring` phase.
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Phase::Exploring,
            iterations_in_phase: 0,
            unique_files_read: BTreeSet::new(),
            unique_searches: BTreeSet::new(),
            files_modified: BTreeSet::new(),
            tests_run: 0,
            should_transition: false,
            recent_new_files: 0,
            saturation_emitted: false,
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Iterations spent in the current phase.
    #[must_use]
    pub const fn iterations_in_phase(&self) -> u64 {
        self.iterations_in_phase
    }

    /// Distinct files read across the run.
    #[must_use]
    pub fn unique_files_read(&self) -> usize {
        self.unique_files_read.len()
    }

    /// Distinct files modified across the run.
    #[must_use]
    pub fn files_modified(&self) -> usize {
        self.files_modified.len()
    }

    /// Tests observed running.
    #[must_use]
    pub const fn tests_run(&self) -> u64 {
        self.tests_run
    }

    /// Whether exploration saturation suggests moving on.
    #[must_use]
    pub const fn should_transition(&self) -> bool {
        self.should_transition
    }

    /// Count one loop iteration against the current phase.
    pub const fn record_iteration(&mut self) {
        self.iterations_in_phase += 1;
    }

    /// Observe one tool call and apply the transition rules.
    pub fn observe(&mut self, tool: &str, args: &Value) -> PhaseUpdate {
        let mut update = PhaseUpdate::default();

        match tool {
            "read_file" => {
                if let Some(path) = str_arg(args, &["path", "file_path", "file"])
                    && self.unique_files_read.insert(path)
                {
                    self.recent_new_files += 1;
                }
            }
            "grep" | "glob" | "search" | "list_directory" => {
                if let Some(q) = str_arg(args, &["pattern", "query", "path"]) {
                    self.unique_searches.insert(q);
                }
            }
            "write_file" | "edit_file" => {
                if let Some(path) = str_arg(args, &["path", "file_path", "file"]) {
                    self.files_modified.insert(path);
                }
                if matches!(self.phase, Phase::Exploring | Phase::Planning) {
                    update.transition = Some(self.transition_to(Phase::Acting));
                }
            }
            "bash" => {
                if let Some(cmd) = str_arg(args, &["command", "cmd"])
                    && test_command_pattern().is_match(&cmd)
                {
                    self.tests_run += 1;
                    if self.phase == Phase::Acting && !self.files_modified.is_empty() {
                        update.transition = Some(self.transition_to(Phase::Verifying));
                    }
                }
            }
            _ => {}
        }

        update.saturation = self.check_saturation();
        update
    }

    /// Evaluate the saturation rule; returns true only on the rising edge.
    fn check_saturation(&mut self) -> bool {
        if self.phase != Phase::Exploring || !self.files_modified.is_empty() {
            return false;
        }

        let by_breadth = self.unique_files_read.len() >= SATURATION_FILES;
        let by_staleness =
            self.iterations_in_phase >= SATURATION_ITERATIONS && self.recent_new_files < 2;

        if by_breadth || by_staleness {
            self.should_transition = true;
            if !self.saturation_emitted {
                self.saturation_emitted = true;
                return true;
            }
        }
        false
    }

    fn transition_to(&mut self, next: Phase) -> (Phase, Phase) {
        let from = self.phase;
        self.phase = next;
        self.iterations_in_phase = 0;
        self.recent_new_files = 0;
        self.should_transition = false;
        self.saturation_emitted = false;
        (from, next)
    }

    /// Reset to the initial exploring state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn str_arg(args: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| args.get(k).and_then(Value::as_str))
        .map(str::to_owned)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn starts_exploring() {
        assert_eq!(PhaseTracker::new().phase(), Phase::Exploring);
    }

    #[test]
    fn write_transitions_to_acting() {
        let mut tracker = PhaseTracker::new();
        let update = tracker.observe("write_file", &json!({"path": "/src/lib.rs"}));
        assert_eq!(update.transition, Some((Phase::Exploring, Phase::Acting)));
        assert_eq!(tracker.phase(), Phase::Acting);
        assert_eq!(tracker.iterations_in_phase(), 0);
    }

    #[test]
    fn test_command_transitions_to_verifying() {
        let mut tracker = PhaseTracker::new();
        tracker.observe("write_file", &json!({"path": "/src/lib.rs"}));
        let update = tracker.observe("bash", &json!({"command": "cargo test"}));
        assert_eq!(update.transition, Some((Phase::Acting, Phase::Verifying)));
        assert_eq!(tracker.tests_run(), 1);
    }

    #[test]
    fn test_without_modification_stays_put() {
        let mut tracker = PhaseTracker::new();
        let update = tracker.observe("bash", &json!({"command": "pytest"}));
        assert!(update.transition.is_none());
        assert_eq!(tracker.phase(), Phase::Exploring);
    }

    #[test]
    fn saturation_by_breadth_fires_once() {
        // Ten unique reads with zero modifications yield one saturation event.
        let mut tracker = PhaseTracker::new();
        let mut fired = 0;
        for i in 0..12 {
            let update = tracker.observe("read_file", &json!({"path": format!("/f{i}")}));
            if update.saturation {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert!(tracker.should_transition());
    }

    #[test]
    fn saturation_by_staleness() {
        let mut tracker = PhaseTracker::new();
        tracker.observe("read_file", &json!({"path": "/a"}));
        for _ in 0..SATURATION_ITERATIONS {
            tracker.record_iteration();
        }
        // recent_new_files is 1 (< 2) and five iterations have passed.
        let update = tracker.observe("grep", &json!({"pattern": "fn main"}));
        assert!(update.saturation);
    }

    #[test]
    fn write_clears_should_transition() {
        // A write transitions to acting and clears the flag.
        let mut tracker = PhaseTracker::new();
        for i in 0..10 {
            tracker.observe("read_file", &json!({"path": format!("/f{i}")}));
        }
        assert!(tracker.should_transition());
        tracker.observe("write_file", &json!({"path": "/out"}));
        assert!(!tracker.should_transition());
        assert_eq!(tracker.phase(), Phase::Acting);
    }

    #[test]
    fn modified_files_block_saturation() {
        let mut tracker = PhaseTracker::new();
        // A modification recorded while still exploring (e.g. via a resumed
        // run) prevents the nudge even with many reads.
        tracker.files_modified.insert("/done".into());
        for i in 0..12 {
            let update = tracker.observe("read_file", &json!({"path": format!("/f{i}")}));
            assert!(!update.saturation);
        }
    }
}
