//! Typed event stream emitted by the runtime.
//!
//! The scheduler owns an [`EventBus`]; subscribers receive a broadcast
//! receiver that unsubscribes on drop. Emission never fails and subscriber
//! lag never propagates back into the scheduler — a slow listener misses
//! events, it does not slow the run.

use tokio::sync::broadcast;

use crate::message::ToolCall;
use crate::policy::ProfileSource;
use crate::progress::Phase;
use crate::scheduler::CompletionStatus;

/// Broadcast channel depth. Laggards skip, they do not block.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything observable about a run.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Event {
    /// A run is starting.
    RunBefore {
        /// The user task.
        task: String,
    },
    /// A run finished.
    RunAfter {
        /// Terminal status.
        status: CompletionStatus,
    },
    /// An iteration is starting.
    IterationBefore {
        /// 1-based iteration number.
        iteration: u64,
    },
    /// An iteration finished.
    IterationAfter {
        /// 1-based iteration number.
        iteration: u64,
    },
    /// An LLM call is starting.
    LlmStart {
        /// Iteration it belongs to.
        iteration: u64,
    },
    /// An LLM call completed.
    LlmComplete {
        /// Iteration it belongs to.
        iteration: u64,
        /// Prompt tokens.
        input_tokens: u64,
        /// Generated tokens.
        output_tokens: u64,
    },
    /// A tool is about to run.
    ToolStart {
        /// The call being dispatched.
        call: ToolCall,
    },
    /// A tool finished.
    ToolComplete {
        /// Call id.
        call_id: String,
        /// Tool name.
        tool: String,
        /// Whether it succeeded.
        success: bool,
    },
    /// A call was denied by the approval gate.
    ToolBlocked {
        /// Tool name.
        tool: String,
        /// Denial reason.
        reason: String,
    },
    /// A call was forbidden by policy.
    PolicyToolBlocked {
        /// Tool name.
        tool: String,
        /// Policy reason.
        reason: String,
        /// Deciding profile.
        profile: String,
    },
    /// A shell command was forbidden by policy.
    PolicyBashBlocked {
        /// The command.
        command: String,
        /// Policy reason.
        reason: String,
    },
    /// A profile was resolved for an evaluation.
    PolicyProfileResolved {
        /// Profile name.
        profile: String,
        /// Where the selection came from.
        source: ProfileSource,
    },
    /// A soft limit or governor warning.
    BudgetWarning {
        /// Description.
        detail: String,
    },
    /// A hard limit was crossed.
    BudgetExceeded {
        /// Description.
        detail: String,
    },
    /// The stuck heuristic fired.
    ProgressStuck {
        /// Consecutive stuck observations.
        count: u32,
    },
    /// Meaningful progress was observed.
    ProgressMade,
    /// A doom loop was detected (rising edge).
    DoomLoopDetected {
        /// Repeated tool.
        tool: String,
        /// Consecutive identical calls.
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
    /// An extension was requested from the host.
    ExtensionRequested {
        /// Why.
        reason: String,
    },
    /// The host granted an extension.
    ExtensionGranted {
        /// Applied multiplier.
        factor: f64,
    },
    /// The host denied an extension.
    ExtensionDenied,
    /// A call requires approval.
    ApprovalRequired {
        /// Tool name.
        tool: String,
    },
    /// An approval decision arrived.
    ApprovalReceived {
        /// Tool name.
        tool: String,
        /// The decision.
        approved: bool,
    },
    /// A checkpoint was created.
    CheckpointCreated {
        /// Checkpoint id.
        id: String,
        /// Optional label.
        label: Option<String>,
    },
    /// A checkpoint was restored.
    CheckpointRestored {
        /// Checkpoint id.
        id: String,
    },
    /// The thread rolled back to a checkpoint.
    Rollback {
        /// Checkpoint id.
        checkpoint_id: String,
    },
    /// A thread was forked.
    ThreadForked {
        /// Parent thread id.
        parent: String,
        /// Child thread id.
        child: String,
    },
    /// Automatic compaction ran.
    CompactionAuto {
        /// Estimated tokens before.
        tokens_before: u64,
        /// Estimated tokens after.
        tokens_after: u64,
    },
    /// Provider reported a prompt-cache hit.
    CacheHit {
        /// Cached tokens served.
        tokens: u64,
    },
    /// Provider reported no cached tokens.
    CacheMiss,
    /// An MCP server is connecting.
    McpServerConnecting {
        /// Server name.
        server: String,
    },
    /// An MCP server finished its handshake.
    McpServerConnected {
        /// Server name.
        server: String,
        /// Advertised tool count.
        tools: usize,
    },
    /// An MCP server disconnected.
    McpServerDisconnected {
        /// Server name.
        server: String,
    },
    /// An MCP server failed.
    McpServerError {
        /// Server name.
        server: String,
        /// Failure description.
        message: String,
    },
    /// An MCP tool call was issued.
    McpToolCall {
        /// Server name.
        server: String,
        /// Original tool name.
        tool: String,
    },
    /// An MCP tool call completed.
    McpToolResult {
        /// Server name.
        server: String,
        /// Original tool name.
        tool: String,
        /// Whether it succeeded.
        success: bool,
    },
    /// The tool search meta-tool ran.
    McpToolSearch {
        /// Query string.
        query: String,
        /// Result count.
        results: usize,
    },
    /// A summary-only tool was promoted to its full definition.
    McpDynamicLoad {
        /// Exposed tool name.
        tool: String,
    },
    /// A recovery retry is being attempted.
    ResilienceRetry {
        /// Attempt number.
        attempt: u32,
        /// Why.
        reason: String,
    },
    /// The run continues after an ignorable failure.
    ResilienceContinue {
        /// Why.
        reason: String,
    },
    /// A recovery attempt succeeded.
    ResilienceRecovered,
    /// Recovery attempts were exhausted.
    ResilienceFailed {
        /// Why.
        reason: String,
    },
    /// A subagent was spawned.
    AgentSpawn {
        /// Agent id.
        agent_id: String,
    },
    /// A subagent finished.
    AgentComplete {
        /// Agent id.
        agent_id: String,
        /// Whether it succeeded.
        success: bool,
    },
    /// Cancellation was requested.
    CancellationRequested {
        /// Optional reason.
        reason: Option<String>,
    },
    /// Cancellation finished; no further LLM or tool work will happen.
    CancellationCompleted,
}

/// Multi-producer broadcast bus for [`Event`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Subscribe; dropping the receiver unsubscribes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Emit an event. Never fails: with no subscribers the event is
    /// dropped, and subscriber errors never reach the emitter.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Current subscriber count.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(Event::ProgressMade);
        match rx.recv().await.unwrap() {
            Event::ProgressMade => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(Event::CacheMiss);
    }

    #[tokio::test]
    async fn dropped_receiver_unsubscribes() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(Event::CancellationCompleted);
        assert!(matches!(a.recv().await.unwrap(), Event::CancellationCompleted));
        assert!(matches!(b.recv().await.unwrap(), Event::CancellationCompleted));
    }
}
