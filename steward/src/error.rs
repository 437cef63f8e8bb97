//! Error types for the steward runtime.
//!
//! [`Error`] covers every failure mode the scheduler can observe: provider
//! failures, policy and approval denials, tool and MCP failures, budget
//! exhaustion, and cancellation. The scheduler's propagation policy is
//! expressed through [`Error::is_fatal`] and [`Error::is_retryable`] rather
//! than scattered `match` arms.

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for all steward operations.
///
/// Each variant represents a distinct failure mode, enabling callers to
/// pattern-match on specific cases (e.g., retrying transient provider
/// errors while surfacing tool errors back to the model).
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Authentication or authorization failure against the LLM provider.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Provider rate limit exceeded.
    #[error("rate limited{}", .retry_after_secs.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimited {
        /// Seconds to wait, when the provider supplied `Retry-After`.
        retry_after_secs: Option<u64>,
    },

    /// Provider-side 5xx failure.
    #[error("server error: {0}")]
    ServerError(String),

    /// Network or connection failure.
    #[error("network error: {0}")]
    NetworkError(String),

    /// An operation exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The conversation no longer fits the model's context window.
    #[error("context length exceeded: estimated {estimated} tokens, limit {limit}")]
    ContextLengthExceeded {
        /// Estimated tokens in the request.
        estimated: u64,
        /// Provider or configured limit.
        limit: u64,
    },

    /// The request was malformed or violated an internal invariant.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A tool call was blocked by the policy engine.
    #[error("policy denied '{tool}': {reason}")]
    PolicyDenied {
        /// Tool (or command) that was blocked.
        tool: String,
        /// Why the policy blocked it.
        reason: String,
    },

    /// A tool call was denied by the human approval gate.
    #[error("approval denied for '{tool}'{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    ApprovalDenied {
        /// Tool that was denied.
        tool: String,
        /// Optional denial reason from the approver.
        reason: Option<String>,
    },

    /// A tool executed but failed.
    #[error("tool '{tool}' failed: {message}")]
    ToolExecution {
        /// Name of the failing tool.
        tool: String,
        /// Failure description.
        message: String,
    },

    /// An MCP server violated the JSON-RPC protocol.
    #[error("MCP protocol error on '{server}': {message}")]
    McpProtocol {
        /// Server name.
        server: String,
        /// Violation description.
        message: String,
    },

    /// An MCP server is not connected or its process has exited.
    #[error("MCP server '{server}' unavailable: {message}")]
    McpServerUnavailable {
        /// Server name.
        server: String,
        /// Why it is unavailable.
        message: String,
    },

    /// A budget dimension's hard limit was exceeded.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    /// The run was cancelled.
    #[error("cancelled{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Cancelled {
        /// Optional cancellation reason.
        reason: Option<String>,
    },

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an authentication error.
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed(message.into())
    }

    /// Create a rate-limit error.
    #[must_use]
    pub const fn rate_limited(retry_after_secs: Option<u64>) -> Self {
        Self::RateLimited { retry_after_secs }
    }

    /// Create a server error.
    #[must_use]
    pub fn server(message: impl Into<String>) -> Self {
        Self::ServerError(message.into())
    }

    /// Create a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError(message.into())
    }

    /// Create a timeout error.
    #[must_use]
    pub const fn timeout(after: std::time::Duration) -> Self {
        Self::Timeout(after)
    }

    /// Create an invalid-request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create a policy-denied error.
    #[must_use]
    pub fn policy_denied(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PolicyDenied {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Create an approval-denied error.
    #[must_use]
    pub fn approval_denied(tool: impl Into<String>, reason: Option<String>) -> Self {
        Self::ApprovalDenied {
            tool: tool.into(),
            reason,
        }
    }

    /// Create a tool execution error.
    #[must_use]
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create an MCP protocol error.
    #[must_use]
    pub fn mcp_protocol(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::McpProtocol {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Create an MCP server-unavailable error.
    #[must_use]
    pub fn mcp_unavailable(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::McpServerUnavailable {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Create a budget-exceeded error.
    #[must_use]
    pub fn budget(message: impl Into<String>) -> Self {
        Self::BudgetExceeded(message.into())
    }

    /// Create a cancellation error.
    #[must_use]
    pub const fn cancelled(reason: Option<String>) -> Self {
        Self::Cancelled { reason }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether this error terminates the run outright.
    ///
    /// Only authentication failures, malformed requests, and cancellation
    /// are fatal. Everything else either retries, degrades, or is surfaced
    /// back to the model as a tool-role message.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::InvalidRequest(_) | Self::Cancelled { .. }
        )
    }

    /// Whether a transport-level retry is worthwhile.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError(_)
                | Self::NetworkError(_)
                | Self::Timeout(_)
        )
    }

    /// Whether this failure should be surfaced to the model as a synthetic
    /// tool-role message instead of terminating the run.
    #[must_use]
    pub const fn surfaces_to_model(&self) -> bool {
        matches!(
            self,
            Self::PolicyDenied { .. }
                | Self::ApprovalDenied { .. }
                | Self::ToolExecution { .. }
                | Self::McpServerUnavailable { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(Error::auth("bad key").is_fatal());
        assert!(Error::invalid_request("nope").is_fatal());
        assert!(Error::cancelled(None).is_fatal());
        assert!(!Error::rate_limited(Some(3)).is_fatal());
        assert!(!Error::tool("bash", "exit 1").is_fatal());
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::rate_limited(None).is_retryable());
        assert!(Error::server("500").is_retryable());
        assert!(Error::network("reset").is_retryable());
        assert!(Error::timeout(std::time::Duration::from_secs(30)).is_retryable());
        assert!(!Error::auth("x").is_retryable());
        assert!(!Error::policy_denied("rm", "blocked").is_retryable());
    }

    #[test]
    fn surfaced_errors_are_non_fatal() {
        for err in [
            Error::policy_denied("bash", "write verb"),
            Error::approval_denied("delete_db", Some("no".into())),
            Error::tool("grep", "pattern error"),
            Error::mcp_unavailable("fs", "process exited"),
        ] {
            assert!(err.surfaces_to_model());
            assert!(!err.is_fatal());
        }
    }

    #[test]
    fn display_includes_context() {
        let err = Error::policy_denied("bash", "rm -rf is blocked");
        assert!(err.to_string().contains("bash"));
        assert!(err.to_string().contains("rm -rf"));

        let err = Error::rate_limited(Some(7));
        assert!(err.to_string().contains("7s"));
    }

    #[test]
    fn context_length_fields() {
        let err = Error::ContextLengthExceeded {
            estimated: 130_000,
            limit: 128_000,
        };
        assert!(err.to_string().contains("130000"));
        assert!(!err.is_fatal());
        assert!(!err.is_retryable());
    }
}
