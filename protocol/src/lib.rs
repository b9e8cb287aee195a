//! Wire protocol spoken between the authorization broker and its clients.
//!
//! Everything here is plain data: serde-tagged JSON frames plus the small
//! enums they carry. The transport (WebSocket or equivalent) is out of scope;
//! the broker core consumes and produces these types and nothing lower-level.

mod types;
mod wire;

pub use types::PermissionMode;
pub use types::PlanDecision;
pub use types::RiskLevel;
pub use types::ToolCategory;
pub use types::UserDecision;
pub use wire::ClientMessage;
pub use wire::InputMap;
pub use wire::PendingRequestSummary;
pub use wire::PermissionErrorMsg;
pub use wire::PermissionRequestMsg;
pub use wire::PermissionResponseMsg;
pub use wire::PlanApprovalRequestMsg;
pub use wire::PlanApprovalResponseMsg;
pub use wire::QueueStatusMsg;
pub use wire::ServerMessage;
pub use wire::parse_client_message;
