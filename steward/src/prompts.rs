//! Guidance prompts injected by the governor and context manager.
//!
//! All system-side nudges live here so their wording is testable and
//! consistent. Templates are plain functions; no template engine is
//! warranted at this size.

/// Injected when the iteration budget is exhausted: the model gets exactly
/// one more text-only turn to summarize before the run stops.
pub const MAX_STEPS_PROMPT: &str = "[System] You have reached the maximum number of steps for \
this run. Do not call any more tools. Summarize what you accomplished, what remains to be done, \
and any important findings, in your next message.";

/// Injected when a doom loop is detected.
#[must_use]
pub fn doom_loop(tool: &str, count: usize) -> String {
    format!(
        "[System] You have called the tool '{tool}' with identical arguments {count} times in a \
row. Repeating the same call will produce the same result. Step back, reconsider your approach, \
and either use a different tool, change the arguments, or explain what is blocking you."
    )
}

/// Injected when exploration saturates without any modification.
#[must_use]
pub fn exploration_nudge(files_read: usize, iterations: u64) -> String {
    format!(
        "[System] You've read {files_read} files across {iterations} iterations without \
modifying anything. If you have enough context, start acting on the task now; if something is \
unclear, state what is missing instead of reading more files."
    )
}

/// Injected when a soft budget limit is crossed.
#[must_use]
pub fn soft_budget_wrap_up(dimension: &str, percent_used: f64) -> String {
    format!(
        "[System] You have used {:.0}% of your {dimension} budget. Begin wrapping up: finish the \
current step, then summarize your results. Avoid starting new lines of work.",
        percent_used * 100.0
    )
}

/// Injected when the model claims completion but the completion criteria
/// are not met.
#[must_use]
pub fn completion_recovery(detail: &str) -> String {
    format!(
        "[System] Your last message looked like a final answer, but the task is not complete: \
{detail}. Continue working on the remaining items, or state explicitly why they cannot be done."
    )
}

/// System prompt for the compaction summarizer.
pub const SUMMARIZATION_PROMPT: &str = "Summarize the conversation below for an AI agent that \
will continue the task. You MUST preserve: every user request, the current goal, all file paths \
discussed, decisions that were made, and any unresolved errors. Be concise but lose nothing an \
agent would need to continue seamlessly. Respond with the summary only.";

/// Prefix of the synthetic summary message produced by compaction.
pub const SUMMARY_PREFIX: &str = "[Conversation Summary -";
