//! Typed events published by the managers.
//!
//! The dispatcher subscribes to these over a bounded channel and turns them
//! into wire frames; nothing else observes them. Payloads carry everything
//! the dispatcher needs, so fan-out never reaches back into manager state.

use toolgate_protocol::InputMap;
use toolgate_protocol::RiskLevel;
use toolgate_protocol::ToolCategory;

#[derive(Debug, Clone)]
pub enum BrokerEvent {
    PermissionRequest(PermissionRequestEvent),
    PermissionTimeout(PermissionTimeoutEvent),
    PermissionCancelled(PermissionCancelledEvent),
    PlanRequest(PlanRequestEvent),
    PlanTimeout(PlanTimeoutEvent),
}

/// A newly queued permission request, already formatted for display.
#[derive(Debug, Clone)]
pub struct PermissionRequestEvent {
    pub id: String,
    pub tool_name: String,
    pub input: InputMap,
    pub summary: String,
    pub risk_level: RiskLevel,
    pub category: ToolCategory,
    pub session_id: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct PermissionTimeoutEvent {
    pub request_id: String,
    pub tool_name: String,
}

#[derive(Debug, Clone)]
pub struct PermissionCancelledEvent {
    pub request_id: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct PlanRequestEvent {
    pub plan_id: String,
    pub content: String,
    pub session_id: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct PlanTimeoutEvent {
    pub plan_id: String,
}
