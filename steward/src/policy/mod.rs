//! Profile-driven tool and command gating.
//!
//! A named [`PolicyProfile`] is the unit of configuration: which tools an
//! agent may call, how much shell it gets, and what needs human approval.
//! Profiles are selected deterministically (explicit override, then worker
//! capability, then task type, then default) and every evaluation reports
//! which profile decided and why.

pub mod command;
pub mod paths;

pub use command::{BashMode, BashWriteProtection, CommandEvaluation, evaluate_command};
pub use paths::{is_path_allowed, resolve_symlinks};

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::ToolCall;

/// A policy decision for one tool call or command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyDecision {
    /// Run without asking.
    #[default]
    Allow,
    /// Route through the approval gate.
    Prompt,
    /// Refuse outright.
    Forbidden,
}

/// How the profile's tool list is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolAccessMode {
    /// Every tool is reachable (minus `denied_tools`).
    #[default]
    All,
    /// Only `allowed_tools` are reachable.
    Whitelist,
    /// Everything except `denied_tools` is reachable.
    Denylist,
}

/// An argument condition on a per-tool rule. First match wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgCondition {
    /// Argument key to inspect.
    pub key: String,
    /// Substring that triggers this condition.
    pub contains: String,
    /// Decision applied when the condition matches.
    pub decision: PolicyDecision,
}

impl ArgCondition {
    /// Create a condition.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        contains: impl Into<String>,
        decision: PolicyDecision,
    ) -> Self {
        Self {
            key: key.into(),
            contains: contains.into(),
            decision,
        }
    }

    fn matches(&self, args: &Value) -> bool {
        let Some(value) = args.get(&self.key) else {
            return false;
        };
        match value {
            Value::String(s) => s.contains(&self.contains),
            other => other.to_string().contains(&self.contains),
        }
    }
}

/// Per-tool policy with optional argument conditions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRule {
    /// Decision when no condition matches.
    pub decision: PolicyDecision,
    /// Argument conditions, evaluated in order.
    #[serde(default)]
    pub conditions: Vec<ArgCondition>,
}

impl ToolRule {
    /// A rule with no conditions.
    #[must_use]
    pub const fn new(decision: PolicyDecision) -> Self {
        Self {
            decision,
            conditions: Vec::new(),
        }
    }

    /// Add an argument condition.
    #[must_use]
    pub fn with_condition(mut self, condition: ArgCondition) -> Self {
        self.conditions.push(condition);
        self
    }
}

/// Approval pattern lists carried by a profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRules {
    /// Tool-name substrings that never need approval.
    #[serde(default)]
    pub auto_approve: Vec<String>,
    /// Tool-name substrings approved once, then remembered for the run.
    #[serde(default)]
    pub scoped_approve: Vec<String>,
    /// Tool-name substrings that always need approval.
    #[serde(default)]
    pub require_approval: Vec<String>,
}

/// A named bundle of tool, command, and approval policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyProfile {
    /// How the tool lists are interpreted.
    #[serde(default)]
    pub tool_access_mode: ToolAccessMode,
    /// Whitelist (used when mode is `Whitelist`).
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Tools that are always forbidden.
    #[serde(default)]
    pub denied_tools: Vec<String>,
    /// Shell access level.
    #[serde(default)]
    pub bash_mode: BashMode,
    /// File-mutation overlay for shell commands.
    #[serde(default)]
    pub bash_write_protection: BashWriteProtection,
    /// Approval pattern lists.
    #[serde(default)]
    pub approval: ApprovalRules,
    /// Per-tool rules.
    #[serde(default)]
    pub tool_rules: HashMap<String, ToolRule>,
    /// Decision when nothing else matches.
    #[serde(default = "default_decision")]
    pub default_decision: PolicyDecision,
    /// Extra blocked command patterns (substring match).
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    /// When non-empty, commands must start with one of these prefixes.
    #[serde(default)]
    pub allowed_command_prefixes: Vec<String>,
}

const fn default_decision() -> PolicyDecision {
    PolicyDecision::Allow
}

/// Where a profile selection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileSource {
    /// Caller named the profile outright.
    ExplicitOverride,
    /// Selected by the worker's capability class.
    WorkerCapability,
    /// Selected by the task type.
    TaskType,
    /// Fell through to the default profile.
    Default,
}

/// Inputs to profile resolution, in precedence order.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluationContext<'a> {
    /// Explicit profile override.
    pub explicit_profile: Option<&'a str>,
    /// Worker capability class.
    pub worker_capability: Option<&'a str>,
    /// Task type.
    pub task_type: Option<&'a str>,
}

/// Result of a profile resolution, reported on every evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedProfile {
    /// Profile name.
    pub name: String,
    /// Selection source.
    pub source: ProfileSource,
}

/// Result of a tool evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolEvaluation {
    /// The decision.
    pub decision: PolicyDecision,
    /// Why.
    pub reason: String,
    /// Which profile decided.
    pub profile: ResolvedProfile,
    /// Conditions that matched, for audit.
    pub matched_conditions: Vec<String>,
}

/// Profile registry plus path confinement.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    profiles: HashMap<String, PolicyProfile>,
    default_profile: String,
    task_type_profiles: HashMap<String, String>,
    capability_profiles: HashMap<String, String>,
    allowed_paths: Vec<PathBuf>,
}

impl PolicyEngine {
    /// Create an engine with one default profile.
    #[must_use]
    pub fn new(default_name: impl Into<String>, default_profile: PolicyProfile) -> Self {
        let default_name = default_name.into();
        let mut profiles = HashMap::new();
        profiles.insert(default_name.clone(), default_profile);
        Self {
            profiles,
            default_profile: default_name,
            task_type_profiles: HashMap::new(),
            capability_profiles: HashMap::new(),
            allowed_paths: Vec::new(),
        }
    }

    /// A permissive engine: everything allowed, full shell, no confinement.
    #[must_use]
    pub fn permissive() -> Self {
        Self::new(
            "permissive",
            PolicyProfile {
                bash_mode: BashMode::Full,
                ..PolicyProfile::default()
            },
        )
    }

    /// Register a named profile.
    #[must_use]
    pub fn with_profile(mut self, name: impl Into<String>, profile: PolicyProfile) -> Self {
        self.profiles.insert(name.into(), profile);
        self
    }

    /// Map a task type to a profile name.
    #[must_use]
    pub fn with_task_type(mut self, task_type: impl Into<String>, profile: impl Into<String>) -> Self {
        self.task_type_profiles.insert(task_type.into(), profile.into());
        self
    }

    /// Map a worker capability to a profile name.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>, profile: impl Into<String>) -> Self {
        self.capability_profiles.insert(capability.into(), profile.into());
        self
    }

    /// Confine filesystem-path arguments to these roots. Empty = disabled.
    #[must_use]
    pub fn with_allowed_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.allowed_paths = paths;
        self
    }

    /// Resolve the profile for a context: explicit override > worker
    /// capability > task type > default.
    #[must_use]
    pub fn resolve_profile(&self, context: &EvaluationContext<'_>) -> ResolvedProfile {
        if let Some(name) = context.explicit_profile
            && self.profiles.contains_key(name)
        {
            return ResolvedProfile {
                name: name.to_owned(),
                source: ProfileSource::ExplicitOverride,
            };
        }
        if let Some(name) = context
            .worker_capability
            .and_then(|c| self.capability_profiles.get(c))
            && self.profiles.contains_key(name)
        {
            return ResolvedProfile {
                name: name.clone(),
                source: ProfileSource::WorkerCapability,
            };
        }
        if let Some(name) = context
            .task_type
            .and_then(|t| self.task_type_profiles.get(t))
            && self.profiles.contains_key(name)
        {
            return ResolvedProfile {
                name: name.clone(),
                source: ProfileSource::TaskType,
            };
        }
        ResolvedProfile {
            name: self.default_profile.clone(),
            source: ProfileSource::Default,
        }
    }

    fn profile(&self, resolved: &ResolvedProfile) -> &PolicyProfile {
        self.profiles
            .get(&resolved.name)
            .unwrap_or_else(|| &self.profiles[&self.default_profile])
    }

    /// Evaluate one tool call.
    ///
    /// Path confinement runs first and is mandatory; it precedes approval
    /// and cannot be overridden by per-tool rules. Bash calls additionally
    /// run the command pipeline.
    #[must_use]
    pub fn evaluate_tool(&self, call: &ToolCall, context: &EvaluationContext<'_>) -> ToolEvaluation {
        let resolved = self.resolve_profile(context);
        let profile = self.profile(&resolved);

        // Path confinement precedes everything else.
        if !self.allowed_paths.is_empty() {
            for key in ["path", "file_path", "file", "cwd", "dir", "directory"] {
                if let Some(path) = call.arguments.get(key).and_then(Value::as_str)
                    && !is_path_allowed(std::path::Path::new(path), &self.allowed_paths)
                {
                    return ToolEvaluation {
                        decision: PolicyDecision::Forbidden,
                        reason: format!("path '{path}' escapes the allowed roots"),
                        profile: resolved,
                        matched_conditions: vec![format!("path:{key}")],
                    };
                }
            }
        }

        // Bash routes through the command pipeline as well.
        if call.name == "bash"
            && let Some(cmd) = call
                .arguments
                .get("command")
                .or_else(|| call.arguments.get("cmd"))
                .and_then(Value::as_str)
        {
            let evaluation = evaluate_command(
                cmd,
                profile.bash_mode,
                profile.bash_write_protection,
                &profile.blocked_commands,
                &profile.allowed_command_prefixes,
            );
            if evaluation.decision == PolicyDecision::Forbidden {
                return ToolEvaluation {
                    decision: PolicyDecision::Forbidden,
                    reason: evaluation.reason,
                    profile: resolved,
                    matched_conditions: vec!["command".to_owned()],
                };
            }
        }

        // 1. Denied tools are forbidden in every mode.
        if profile.denied_tools.iter().any(|t| t == &call.name) {
            return ToolEvaluation {
                decision: PolicyDecision::Forbidden,
                reason: format!("tool '{}' is denied by profile", call.name),
                profile: resolved,
                matched_conditions: Vec::new(),
            };
        }

        // 2. Whitelist mode forbids anything not listed.
        if profile.tool_access_mode == ToolAccessMode::Whitelist
            && !profile.allowed_tools.iter().any(|t| t == &call.name)
        {
            return ToolEvaluation {
                decision: PolicyDecision::Forbidden,
                reason: format!("tool '{}' is not on the whitelist", call.name),
                profile: resolved,
                matched_conditions: Vec::new(),
            };
        }

        // 3. Per-tool rule: first matching condition wins, else the rule.
        if let Some(rule) = profile.tool_rules.get(&call.name) {
            for condition in &rule.conditions {
                if condition.matches(&call.arguments) {
                    return ToolEvaluation {
                        decision: condition.decision,
                        reason: format!(
                            "argument '{}' contains '{}'",
                            condition.key, condition.contains
                        ),
                        profile: resolved,
                        matched_conditions: vec![format!(
                            "{}~{}",
                            condition.key, condition.contains
                        )],
                    };
                }
            }
            return ToolEvaluation {
                decision: rule.decision,
                reason: format!("per-tool rule for '{}'", call.name),
                profile: resolved,
                matched_conditions: Vec::new(),
            };
        }

        // 4. Profile default.
        ToolEvaluation {
            decision: profile.default_decision,
            reason: "profile default".to_owned(),
            profile: resolved,
            matched_conditions: Vec::new(),
        }
    }

    /// Evaluate a raw command string under the resolved profile.
    #[must_use]
    pub fn evaluate_command(
        &self,
        command: &str,
        context: &EvaluationContext<'_>,
    ) -> CommandEvaluation {
        let resolved = self.resolve_profile(context);
        let profile = self.profile(&resolved);
        evaluate_command(
            command,
            profile.bash_mode,
            profile.bash_write_protection,
            &profile.blocked_commands,
            &profile.allowed_command_prefixes,
        )
    }

    /// The approval rules of the resolved profile.
    #[must_use]
    pub fn approval_rules(&self, context: &EvaluationContext<'_>) -> ApprovalRules {
        let resolved = self.resolve_profile(context);
        self.profile(&resolved).approval.clone()
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

    fn ctx() -> EvaluationContext<'static> {
        EvaluationContext::default()
    }

    mod resolution {
        use super::*;

        fn engine() -> PolicyEngine {
            PolicyEngine::new("default", PolicyProfile::default())
                .with_profile("restricted", PolicyProfile::default())
                .with_profile("trusted", PolicyProfile::default())
                .with_task_type("research", "restricted")
                .with_capability("senior", "trusted")
        }

        #[test]
        fn explicit_override_wins() {
            let resolved = engine().resolve_profile(&EvaluationContext {
                explicit_profile: Some("restricted"),
                worker_capability: Some("senior"),
                task_type: Some("research"),
            });
            assert_eq!(resolved.name, "restricted");
            assert_eq!(resolved.source, ProfileSource::ExplicitOverride);
        }

        #[test]
        fn capability_beats_task_type() {
            let resolved = engine().resolve_profile(&EvaluationContext {
                explicit_profile: None,
                worker_capability: Some("senior"),
                task_type: Some("research"),
            });
            assert_eq!(resolved.name, "trusted");
            assert_eq!(resolved.source, ProfileSource::WorkerCapability);
        }

        #[test]
        fn task_type_beats_default() {
            let resolved = engine().resolve_profile(&EvaluationContext {
                task_type: Some("research"),
                ..Default::default()
            });
            assert_eq!(resolved.name, "restricted");
            assert_eq!(resolved.source, ProfileSource::TaskType);
        }

        #[test]
        fn unknown_override_falls_through() {
            let resolved = engine().resolve_profile(&EvaluationContext {
                explicit_profile: Some("nope"),
                ..Default::default()
            });
            assert_eq!(resolved.source, ProfileSource::Default);
        }
    }

    mod tool_decisions {
        use super::*;

        #[test]
        fn denied_beats_everything() {
            // Precedence: denied > whitelist-forbidden > explicit-allow > default.
            let mut rules = HashMap::new();
            rules.insert("bash".to_owned(), ToolRule::new(PolicyDecision::Allow));
            let engine = PolicyEngine::new(
                "p",
                PolicyProfile {
                    denied_tools: vec!["bash".to_owned()],
                    tool_rules: rules,
                    ..PolicyProfile::default()
                },
            );
            let result = engine.evaluate_tool(&call("bash", json!({})), &ctx());
            assert_eq!(result.decision, PolicyDecision::Forbidden);
            assert!(result.reason.contains("denied"));
        }

        #[test]
        fn whitelist_mode_forbids_unlisted() {
            let engine = PolicyEngine::new(
                "p",
                PolicyProfile {
                    tool_access_mode: ToolAccessMode::Whitelist,
                    allowed_tools: vec!["read_file".to_owned()],
                    ..PolicyProfile::default()
                },
            );
            let ok = engine.evaluate_tool(&call("read_file", json!({})), &ctx());
            assert_eq!(ok.decision, PolicyDecision::Allow);
            let blocked = engine.evaluate_tool(&call("write_file", json!({})), &ctx());
            assert_eq!(blocked.decision, PolicyDecision::Forbidden);
        }

        #[test]
        fn condition_overrides_rule_default() {
            // Per-tool conditions override the rule's own decision.
            let mut rules = HashMap::new();
            rules.insert(
                "bash".to_owned(),
                ToolRule::new(PolicyDecision::Allow).with_condition(ArgCondition::new(
                    "command",
                    "--force",
                    PolicyDecision::Prompt,
                )),
            );
            let engine = PolicyEngine::new(
                "p",
                PolicyProfile {
                    bash_mode: BashMode::Full,
                    tool_rules: rules,
                    ..PolicyProfile::default()
                },
            );

            let plain = engine.evaluate_tool(&call("bash", json!({"command": "git push"})), &ctx());
            assert_eq!(plain.decision, PolicyDecision::Allow);

            let forced =
                engine.evaluate_tool(&call("bash", json!({"command": "git push --force"})), &ctx());
            assert_eq!(forced.decision, PolicyDecision::Prompt);
            assert_eq!(forced.matched_conditions, vec!["command~--force"]);
        }

        #[test]
        fn first_matching_condition_wins() {
            let mut rules = HashMap::new();
            rules.insert(
                "write_file".to_owned(),
                ToolRule::new(PolicyDecision::Allow)
                    .with_condition(ArgCondition::new("path", "/etc", PolicyDecision::Forbidden))
                    .with_condition(ArgCondition::new("path", "/", PolicyDecision::Prompt)),
            );
            let engine = PolicyEngine::new(
                "p",
                PolicyProfile {
                    tool_rules: rules,
                    ..PolicyProfile::default()
                },
            );
            let result =
                engine.evaluate_tool(&call("write_file", json!({"path": "/etc/hosts"})), &ctx());
            assert_eq!(result.decision, PolicyDecision::Forbidden);
        }

        #[test]
        fn default_decision_applies() {
            let engine = PolicyEngine::new(
                "p",
                PolicyProfile {
                    default_decision: PolicyDecision::Prompt,
                    ..PolicyProfile::default()
                },
            );
            let result = engine.evaluate_tool(&call("anything", json!({})), &ctx());
            assert_eq!(result.decision, PolicyDecision::Prompt);
        }

        #[test]
        fn bash_command_pipeline_applies() {
            let engine = PolicyEngine::new(
                "p",
                PolicyProfile {
                    bash_mode: BashMode::ReadOnly,
                    ..PolicyProfile::default()
                },
            );
            let result =
                engine.evaluate_tool(&call("bash", json!({"command": "rm file"})), &ctx());
            assert_eq!(result.decision, PolicyDecision::Forbidden);
        }
    }

    mod confinement {
        use super::*;

        #[test]
        fn out_of_root_path_is_forbidden() {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().canonicalize().unwrap();
            let engine = PolicyEngine::permissive().with_allowed_paths(vec![root.clone()]);

            let inside = engine.evaluate_tool(
                &call("read_file", json!({"path": root.join("f.txt")})),
                &ctx(),
            );
            assert_eq!(inside.decision, PolicyDecision::Allow);

            let outside =
                engine.evaluate_tool(&call("read_file", json!({"path": "/etc/passwd"})), &ctx());
            assert_eq!(outside.decision, PolicyDecision::Forbidden);
            assert!(outside.reason.contains("escapes"));
        }

        #[cfg(unix)]
        #[test]
        fn symlinked_path_argument_is_forbidden() {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().canonicalize().unwrap();
            std::os::unix::fs::symlink("/etc", root.join("escape")).unwrap();

            let engine = PolicyEngine::permissive().with_allowed_paths(vec![root.clone()]);
            let result = engine.evaluate_tool(
                &call("read_file", json!({"path": root.join("escape/passwd")})),
                &ctx(),
            );
            assert_eq!(result.decision, PolicyDecision::Forbidden);
        }

        #[test]
        fn no_roots_disables_confinement() {
            let engine = PolicyEngine::permissive();
            let result =
                engine.evaluate_tool(&call("read_file", json!({"path": "/etc/passwd"})), &ctx());
            assert_eq!(result.decision, PolicyDecision::Allow);
        }
    }
}
