//! Pausable monotonic clock.
//!
//! Wall-clock budget accounting must exclude spans where the run is parked
//! (most importantly while a subagent runs on the parent's behalf). The
//! clock pauses with a depth counter so nested pause/resume pairs compose.

use std::time::{Duration, Instant};

/// A monotonic clock whose elapsed time excludes paused spans.
#[derive(Debug, Clone)]
pub struct PausableClock {
    started: Instant,
    paused_total: Duration,
    pause_depth: u32,
    pause_started: Option<Instant>,
}

impl PausableClock {
    /// Start a new clock at the current instant.
    #[must_use]
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            paused_total: Duration::ZERO,
            pause_depth: 0,
            pause_started: None,
        }
    }

    /// Effective elapsed time: real elapsed minus all paused spans.
    #[must_use]
    pub fn effective_elapsed(&self) -> Duration {
        let raw = self.started.elapsed();
        let paused = match self.pause_started {
            Some(since) => self.paused_total + since.elapsed(),
            None => self.paused_total,
        };
        raw.saturating_sub(paused)
    }

    /// Pause accounting. Safe to call while already paused; each `pause`
    /// must be matched by a `resume` before time accrues again.
    pub fn pause(&mut self) {
        if self.pause_depth == 0 {
            self.pause_started = Some(Instant::now());
        }
        self.pause_depth += 1;
    }

    /// Resume accounting. Extra calls with no matching `pause` are ignored.
    pub fn resume(&mut self) {
        match self.pause_depth {
            0 => {}
            1 => {
                self.pause_depth = 0;
                if let Some(since) = self.pause_started.take() {
                    self.paused_total += since.elapsed();
                }
            }
            _ => self.pause_depth -= 1,
        }
    }

    /// Whether the clock is currently paused.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.pause_depth > 0
    }

    /// Restart the clock from now, clearing paused state.
    pub fn reset(&mut self) {
        *self = Self::start();
    }
}

impl Default for PausableClock {
    fn default() -> Self {
        Self::start()
    }
}
