use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerErr>;

#[derive(Error, Debug)]
pub enum BrokerErr {
    /// The permission queue already holds the maximum number of pending
    /// requests. Reported to the caller; never retried internally.
    #[error("permission queue is full")]
    QueueFull,

    /// A plan approval is already pending. Plans are single-slot across the
    /// whole broker.
    #[error("another plan approval is already in flight")]
    PlanInFlight,

    /// The agent cancelled the tool call before a decision arrived. Distinct
    /// from a user denial.
    #[error("tool call was interrupted before a decision was made")]
    Interrupted,

    /// The session owning this request was dropped while it was pending.
    #[error("session closed while the request was pending")]
    SessionClosed,

    /// The user (or a timeout) rejected the proposed plan. The agent runtime
    /// is expected to abort the query.
    #[error("plan rejected: {reason}")]
    PlanRejected { reason: String },

    /// The broker is shutting down; every in-flight operation is aborted
    /// with this error.
    #[error("broker is shutting down")]
    Shutdown,
}
