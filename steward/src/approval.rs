//! Human-in-the-loop approval gate.
//!
//! Calls the policy engine marks `prompt`, plus anything whose assessed
//! risk crosses the configured threshold, are routed to a host-supplied
//! handler. Every decision is recorded in a bounded, best-effort audit log
//! that never blocks or fails the decision path.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::ToolCall;
use crate::policy::ApprovalRules;

/// Maximum retained audit entries; oldest are dropped on overflow.
pub const AUDIT_LOG_CAP: usize = 10_000;

/// Assessed risk of a tool call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Harmless.
    #[default]
    Low,
    /// Flag-level risk (force flags, recursive deletes in args).
    Moderate,
    /// Destructive tool names or approval-required patterns.
    High,
    /// Reserved for host escalation.
    Critical,
}

/// Assess the risk of a call from its name and arguments.
#[must_use]
pub fn assess_risk(call: &ToolCall, rules: &ApprovalRules) -> RiskLevel {
    let name = call.name.to_lowercase();

    if rules.require_approval.iter().any(|p| name.contains(&p.to_lowercase())) {
        return RiskLevel::High;
    }
    if rules.auto_approve.iter().any(|p| name.contains(&p.to_lowercase())) {
        return RiskLevel::Low;
    }
    if ["delete", "remove", "drop"].iter().any(|v| name.contains(v)) {
        return RiskLevel::High;
    }

    let args = call.arguments.to_string();
    if ["--force", "-rf", "-fr", "--hard", "--no-verify"]
        .iter()
        .any(|flag| args.contains(flag))
    {
        return RiskLevel::Moderate;
    }

    RiskLevel::Low
}

/// A request routed to the approval handler.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    /// The call awaiting a decision.
    pub call: ToolCall,
    /// Assessed risk.
    pub risk: RiskLevel,
    /// Why approval is being requested.
    pub reason: String,
}

/// The handler's decision.
#[derive(Debug, Clone, Default)]
pub struct ApprovalResponse {
    /// Whether the call may run.
    pub approved: bool,
    /// Optional explanation from the approver.
    pub reason: Option<String>,
    /// When present, the call runs with these arguments instead.
    pub modified_args: Option<Value>,
}

impl ApprovalResponse {
    /// An unconditional approval.
    #[must_use]
    pub const fn approve() -> Self {
        Self {
            approved: true,
            reason: None,
            modified_args: None,
        }
    }

    /// A denial with a reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
            modified_args: None,
        }
    }
}

/// Host-supplied decision maker (interactive prompt, web UI, config).
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Decide whether the call may run.
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalResponse;
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
    /// Tool name.
    pub tool: String,
    /// Call arguments.
    pub arguments: Value,
    /// `approved` or `denied`.
    pub decision: String,
    /// Approver's reason, when given.
    pub reason: Option<String>,
    /// Assessed risk.
    pub risk: RiskLevel,
}

/// Bounded append-only audit log. Writes are best-effort.
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry, dropping the oldest past the cap. Never blocks the
    /// decision path: a poisoned lock silently skips the write.
    pub fn record(&self, entry: AuditEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push_back(entry);
            while entries.len() > AUDIT_LOG_CAP {
                entries.pop_front();
            }
        }
    }

    /// Snapshot of the log, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Current entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The approval gate: risk assessment, scoped-approval memory, audit.
pub struct ApprovalGate {
    handler: Option<Arc<dyn ApprovalHandler>>,
    risk_threshold: RiskLevel,
    scoped_approvals: Mutex<HashSet<String>>,
    audit: AuditLog,
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("risk_threshold", &self.risk_threshold)
            .field("has_handler", &self.handler.is_some())
            .finish_non_exhaustive()
    }
}

impl ApprovalGate {
    /// Create a gate with no handler: every routed call is denied.
    #[must_use]
    pub fn new(risk_threshold: RiskLevel) -> Self {
        Self {
            handler: None,
            risk_threshold,
            scoped_approvals: Mutex::new(HashSet::new()),
            audit: AuditLog::new(),
        }
    }

    /// Attach the host handler.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// The audit log.
    #[must_use]
    pub const fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Whether a call's assessed risk alone requires approval.
    #[must_use]
    pub fn requires_approval(&self, call: &ToolCall, rules: &ApprovalRules) -> bool {
        assess_risk(call, rules) >= self.risk_threshold
    }

    /// Route a call through the gate and return the decision.
    ///
    /// Auto-approve patterns skip the handler; scoped approvals are
    /// remembered per tool for the lifetime of the gate; everything else
    /// asks the handler (deny when none is configured).
    pub async fn request(&self, call: &ToolCall, rules: &ApprovalRules) -> ApprovalResponse {
        let risk = assess_risk(call, rules);
        let name = call.name.to_lowercase();

        let response = if rules.auto_approve.iter().any(|p| name.contains(&p.to_lowercase())) {
            ApprovalResponse::approve()
        } else if self
            .scoped_approvals
            .lock()
            .map(|s| s.contains(&call.name))
            .unwrap_or(false)
        {
            ApprovalResponse::approve()
        } else {
            let response = match &self.handler {
                Some(handler) => {
                    let request = ApprovalRequest {
                        call: call.clone(),
                        risk,
                        reason: format!("tool '{}' requires approval (risk: {risk:?})", call.name),
                    };
                    handler.request_approval(&request).await
                }
                None => ApprovalResponse::deny("no approval handler configured"),
            };

            if response.approved
                && rules.scoped_approve.iter().any(|p| name.contains(&p.to_lowercase()))
                && let Ok(mut scoped) = self.scoped_approvals.lock()
            {
                scoped.insert(call.name.clone());
            }
            response
        };

        self.audit.record(AuditEntry {
            timestamp: Utc::now(),
            tool: call.name.clone(),
            arguments: call.arguments.clone(),
            decision: if response.approved { "approved" } else { "denied" }.to_owned(),
            reason: response.reason.clone(),
            risk,
        });

        response
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(tool: &str, args: Value) -> ToolCall {
        ToolCall::new("id", tool, args)
    }

    struct ApproveAll;

    #[async_trait]
    impl ApprovalHandler for ApproveAll {
        async fn request_approval(&self, _request: &ApprovalRequest) -> ApprovalResponse {
            ApprovalResponse::approve()
        }
    }

    struct DenyAll;

    #[async_trait]
    impl ApprovalHandler for DenyAll {
        async fn request_approval(&self, _request: &ApprovalRequest) -> ApprovalResponse {
            ApprovalResponse::deny("not allowed")
        }
    }

    mod risk {
        use super::*;

        #[test]
        fn destructive_names_are_high() {
            let rules = ApprovalRules::default();
            assert_eq!(assess_risk(&call("delete_table", json!({})), &rules), RiskLevel::High);
            assert_eq!(assess_risk(&call("remove_user", json!({})), &rules), RiskLevel::High);
            assert_eq!(assess_risk(&call("drop_index", json!({})), &rules), RiskLevel::High);
        }

        #[test]
        fn force_flags_are_moderate() {
            let rules = ApprovalRules::default();
            let risky = call("bash", json!({"command": "git push --force"}));
            assert_eq!(assess_risk(&risky, &rules), RiskLevel::Moderate);

            let rf = call("bash", json!({"command": "rm -rf target"}));
            assert_eq!(assess_risk(&rf, &rules), RiskLevel::Moderate);
        }

        #[test]
        fn plain_calls_are_low() {
            let rules = ApprovalRules::default();
            assert_eq!(assess_risk(&call("read_file", json!({"path": "/x"})), &rules), RiskLevel::Low);
        }

        #[test]
        fn require_approval_pattern_is_high() {
            let rules = ApprovalRules {
                require_approval: vec!["deploy".to_owned()],
                ..Default::default()
            };
            assert_eq!(assess_risk(&call("deploy_service", json!({})), &rules), RiskLevel::High);
        }

        #[test]
        fn auto_approve_pattern_is_low_even_when_destructive() {
            let rules = ApprovalRules {
                auto_approve: vec!["remove_temp".to_owned()],
                ..Default::default()
            };
            assert_eq!(assess_risk(&call("remove_temp", json!({})), &rules), RiskLevel::Low);
        }
    }

    mod gate {
        use super::*;

        #[tokio::test]
        async fn no_handler_denies() {
            let gate = ApprovalGate::new(RiskLevel::High);
            let response = gate
                .request(&call("delete_db", json!({})), &ApprovalRules::default())
                .await;
            assert!(!response.approved);
            assert_eq!(gate.audit().len(), 1);
            assert_eq!(gate.audit().entries()[0].decision, "denied");
        }

        #[tokio::test]
        async fn handler_decision_is_respected() {
            let gate = ApprovalGate::new(RiskLevel::High).with_handler(Arc::new(ApproveAll));
            let response = gate
                .request(&call("delete_db", json!({})), &ApprovalRules::default())
                .await;
            assert!(response.approved);
        }

        #[tokio::test]
        async fn auto_approve_skips_handler() {
            let rules = ApprovalRules {
                auto_approve: vec!["read".to_owned()],
                ..Default::default()
            };
            let gate = ApprovalGate::new(RiskLevel::Low).with_handler(Arc::new(DenyAll));
            let response = gate.request(&call("read_file", json!({})), &rules).await;
            assert!(response.approved);
        }

        #[tokio::test]
        async fn scoped_approval_is_remembered() {
            struct ApproveOnce(std::sync::atomic::AtomicUsize);

            #[async_trait]
            impl ApprovalHandler for ApproveOnce {
                async fn request_approval(&self, _request: &ApprovalRequest) -> ApprovalResponse {
                    let n = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if n == 0 {
                        ApprovalResponse::approve()
                    } else {
                        ApprovalResponse::deny("should not be asked again")
                    }
                }
            }

            let rules = ApprovalRules {
                scoped_approve: vec!["write_file".to_owned()],
                ..Default::default()
            };
            let gate = ApprovalGate::new(RiskLevel::Low)
                .with_handler(Arc::new(ApproveOnce(std::sync::atomic::AtomicUsize::new(0))));

            let first = gate.request(&call("write_file", json!({"path": "/a"})), &rules).await;
            assert!(first.approved);
            let second = gate.request(&call("write_file", json!({"path": "/b"})), &rules).await;
            assert!(second.approved, "second call must reuse the scoped approval");
        }

        #[tokio::test]
        async fn threshold_gates_requires_approval() {
            let gate = ApprovalGate::new(RiskLevel::High);
            let rules = ApprovalRules::default();
            assert!(gate.requires_approval(&call("drop_db", json!({})), &rules));
            assert!(!gate.requires_approval(&call("read_file", json!({})), &rules));

            let moderate_gate = ApprovalGate::new(RiskLevel::Moderate);
            let forced = call("bash", json!({"command": "git push --force"}));
            assert!(moderate_gate.requires_approval(&forced, &rules));
        }
    }

    mod audit {
        use super::*;

        #[test]
        fn overflow_drops_oldest() {
            let log = AuditLog::new();
            for i in 0..(AUDIT_LOG_CAP + 5) {
                log.record(AuditEntry {
                    timestamp: Utc::now(),
                    tool: format!("tool_{i}"),
                    arguments: json!({}),
                    decision: "approved".to_owned(),
                    reason: None,
                    risk: RiskLevel::Low,
                });
            }
            assert_eq!(log.len(), AUDIT_LOG_CAP);
            assert_eq!(log.entries()[0].tool, "tool_5");
        }
    }
}
