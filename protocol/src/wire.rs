//! JSON frames exchanged over the bidirectional channel.
//!
//! Frames are internally tagged on `type` with kebab-case tags and camelCase
//! fields, matching what the browser clients expect. Timestamps are epoch
//! milliseconds.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::types::PermissionMode;
use crate::types::PlanDecision;
use crate::types::RiskLevel;
use crate::types::ToolCategory;
use crate::types::UserDecision;

/// Unstructured tool input as proposed by the agent. The broker never
/// interprets it beyond the risk classifier and cache-key whitelists.
pub type InputMap = Map<String, Value>;

/// Frames sent from the broker to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    PermissionRequest(PermissionRequestMsg),

    #[serde(rename_all = "camelCase")]
    PermissionTimeout {
        request_id: String,
        tool_name: String,
        timestamp: i64,
    },

    PermissionQueueStatus(QueueStatusMsg),

    #[serde(rename_all = "camelCase")]
    PermissionCancelled {
        request_id: String,
        reason: String,
        timestamp: i64,
    },

    PermissionError(PermissionErrorMsg),

    #[serde(rename_all = "camelCase")]
    PermissionSyncResponse {
        session_id: String,
        pending_requests: Vec<PendingRequestSummary>,
    },

    PlanApprovalRequest(PlanApprovalRequestMsg),

    #[serde(rename_all = "camelCase")]
    PlanApprovalTimeout { plan_id: String, timestamp: i64 },
}

/// A suspended tool invocation, as presented to the human operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestMsg {
    pub id: String,
    pub tool_name: String,
    pub input: InputMap,
    pub summary: String,
    pub risk_level: RiskLevel,
    pub category: ToolCategory,
    pub timestamp: i64,
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub sequence_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusMsg {
    pub pending: usize,
    pub processing: usize,
    pub timestamp: i64,
}

/// Targeted error reply. `request_id` is absent when the offending frame
/// could not be parsed far enough to extract one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionErrorMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub error: String,
    pub timestamp: i64,
}

/// Pending-request digest served by the sync protocol after a reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequestSummary {
    pub id: String,
    pub tool_name: String,
    pub input: InputMap,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanApprovalRequestMsg {
    pub plan_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub timestamp: i64,
    pub expires_at: i64,
    pub sequence_number: u64,
}

/// Frames sent from clients to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    PermissionResponse(PermissionResponseMsg),

    #[serde(rename_all = "camelCase")]
    PermissionSyncRequest { session_id: String },

    PlanApprovalResponse(PlanApprovalResponseMsg),

    /// Heartbeat reply, for transports without native ping/pong.
    #[serde(rename_all = "camelCase")]
    Pong {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponseMsg {
    pub request_id: String,
    pub decision: UserDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<InputMap>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanApprovalResponseMsg {
    pub plan_id: String,
    pub decision: PlanDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<PermissionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Parse a single inbound frame. Every field and enum value is validated by
/// the schema; callers turn the error into a targeted `permission-error`.
pub fn parse_client_message(raw: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(raw)
}
