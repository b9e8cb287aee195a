use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Effective permission mode for a single agent query.
///
/// `Plan` can transition to `Default` or `AcceptEdits` through plan approval;
/// no other transition happens inside the broker. A new query starts in
/// whatever mode the runtime configures it with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

/// User's decision in response to a permission request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum UserDecision {
    /// Approve this one invocation.
    Allow,

    /// Refuse this invocation; the agent keeps running and may try something
    /// else.
    #[default]
    Deny,

    /// Approve, and auto-approve identical invocations for the remainder of
    /// the session.
    AllowSession,

    /// Approve, and auto-approve identical invocations everywhere. There is
    /// no persistence backend for this yet, so the broker treats it exactly
    /// like [`UserDecision::AllowSession`].
    AllowAlways,
}

impl UserDecision {
    pub fn is_allow(self) -> bool {
        !matches!(self, UserDecision::Deny)
    }

    /// Whether the decision should be remembered in the per-session cache.
    pub fn caches_for_session(self) -> bool {
        matches!(self, UserDecision::AllowSession | UserDecision::AllowAlways)
    }
}

/// User's decision in response to a plan approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PlanDecision {
    Approve,
    Reject,
}

/// Static risk tier of a proposed tool invocation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Coarse grouping of tools, shown alongside the risk level in client UIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ToolCategory {
    ReadOnly,
    Edit,
    Execution,
    Network,
    Unknown,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn user_decision_wire_strings() {
        assert_eq!(
            serde_json::to_string(&UserDecision::AllowSession).unwrap(),
            "\"allow-session\""
        );
        assert_eq!(
            serde_json::from_str::<UserDecision>("\"allow-always\"").unwrap(),
            UserDecision::AllowAlways
        );
        assert_eq!(
            serde_json::from_str::<UserDecision>("\"allow\"").unwrap(),
            UserDecision::Allow
        );
    }

    #[test]
    fn permission_mode_wire_strings() {
        assert_eq!(
            serde_json::to_string(&PermissionMode::AcceptEdits).unwrap(),
            "\"acceptEdits\""
        );
        assert_eq!(
            serde_json::to_string(&PermissionMode::BypassPermissions).unwrap(),
            "\"bypassPermissions\""
        );
    }

    #[test]
    fn unknown_decision_is_rejected() {
        assert!(serde_json::from_str::<UserDecision>("\"maybe\"").is_err());
    }
}
