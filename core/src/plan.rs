// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Single-slot broker for plan approvals.
//!
//! Plans are strategic, not tactical: at most one is pending across the
//! whole broker, and a second request fails fast with `PlanInFlight` instead
//! of queueing. Approval carries the permission mode the rest of the query
//! should run under.

use std::sync::Arc;
use std::sync::Mutex;

use async_channel::Sender;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use toolgate_protocol::PermissionMode;
use toolgate_protocol::PlanDecision;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::BrokerErr;
use crate::error::Result;
use crate::events::BrokerEvent;
use crate::events::PlanRequestEvent;
use crate::events::PlanTimeoutEvent;
use crate::util::now_ms;

/// Successful plan review. `permission_mode` is what the user picked for the
/// remainder of the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOutcome {
    pub permission_mode: PermissionMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanStats {
    pub requested: u64,
    pub approved: u64,
    pub rejected: u64,
    pub timed_out: u64,
}

struct PendingPlan {
    plan_id: String,
    tx: oneshot::Sender<Result<PlanOutcome>>,
    timer: AbortHandle,
}

#[derive(Default)]
struct PlanState {
    current: Option<PendingPlan>,
    stats: PlanStats,
}

pub struct PlanApprovalManager {
    config: BrokerConfig,
    tx_event: Sender<BrokerEvent>,
    state: Mutex<PlanState>,
}

impl PlanApprovalManager {
    pub fn new(config: BrokerConfig, tx_event: Sender<BrokerEvent>) -> Self {
        Self {
            config,
            tx_event,
            state: Mutex::new(PlanState::default()),
        }
    }

    /// Submit a plan for review and suspend until the user settles it.
    pub async fn request_approval(
        self: Arc<Self>,
        content: String,
        session_id: Option<String>,
    ) -> Result<PlanOutcome> {
        let (rx, event) = {
            let mut state = self.state.lock().unwrap();
            if state.current.is_some() {
                return Err(BrokerErr::PlanInFlight);
            }

            let plan_id = Uuid::new_v4().to_string();
            let created_at = now_ms();
            let expires_at = created_at + self.config.permission_timeout.as_millis() as i64;
            let (tx, rx) = oneshot::channel();
            let timer = tokio::spawn({
                let this = Arc::clone(&self);
                let plan_id = plan_id.clone();
                async move {
                    tokio::time::sleep(this.config.permission_timeout).await;
                    this.handle_timeout(&plan_id).await;
                }
            })
            .abort_handle();

            state.current = Some(PendingPlan {
                plan_id: plan_id.clone(),
                tx,
                timer,
            });
            state.stats.requested += 1;

            let event = BrokerEvent::PlanRequest(PlanRequestEvent {
                plan_id,
                content,
                session_id,
                created_at,
                expires_at,
            });
            (rx, event)
        };

        let _ = self.tx_event.send(event).await;
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BrokerErr::Shutdown),
        }
    }

    /// Settle the pending plan. Returns `false` when there is no pending
    /// plan, the id does not match, or an approval lacks a usable mode.
    pub fn resolve(
        &self,
        plan_id: &str,
        decision: PlanDecision,
        permission_mode: Option<PermissionMode>,
        reason: Option<String>,
    ) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state
            .current
            .as_ref()
            .is_some_and(|plan| plan.plan_id == plan_id)
        {
            return false;
        }

        match decision {
            PlanDecision::Approve => {
                let Some(mode @ (PermissionMode::Default | PermissionMode::AcceptEdits)) =
                    permission_mode
                else {
                    // Leave the plan pending; the client can send a valid
                    // response before the timeout.
                    warn!(plan_id, ?permission_mode, "plan approval with unusable mode");
                    return false;
                };
                let Some(plan) = state.current.take() else {
                    return false;
                };
                state.stats.approved += 1;
                drop(state);
                plan.timer.abort();
                info!(plan_id, %mode, "plan approved");
                let _ = plan.tx.send(Ok(PlanOutcome {
                    permission_mode: mode,
                }));
            }
            PlanDecision::Reject => {
                let Some(plan) = state.current.take() else {
                    return false;
                };
                state.stats.rejected += 1;
                drop(state);
                plan.timer.abort();
                info!(plan_id, "plan rejected");
                let _ = plan.tx.send(Err(BrokerErr::PlanRejected {
                    reason: reason.unwrap_or_else(|| "Plan rejected by user".to_string()),
                }));
            }
        }
        true
    }

    pub fn has_pending(&self) -> bool {
        self.state.lock().unwrap().current.is_some()
    }

    pub fn stats(&self) -> PlanStats {
        self.state.lock().unwrap().stats
    }

    /// Reject whatever is pending; used during shutdown.
    pub fn cancel_all(&self) {
        let plan = {
            let mut state = self.state.lock().unwrap();
            state.current.take()
        };
        if let Some(plan) = plan {
            plan.timer.abort();
            info!(plan_id = %plan.plan_id, "cancelling pending plan approval");
            let _ = plan.tx.send(Err(BrokerErr::Shutdown));
        }
    }

    async fn handle_timeout(&self, plan_id: &str) {
        let plan = {
            let mut state = self.state.lock().unwrap();
            if !state
                .current
                .as_ref()
                .is_some_and(|plan| plan.plan_id == plan_id)
            {
                return;
            }
            state.stats.timed_out += 1;
            state.current.take()
        };
        let Some(plan) = plan else {
            return;
        };
        info!(plan_id, "plan approval timed out");
        let _ = plan.tx.send(Err(BrokerErr::PlanRejected {
            reason: "Plan approval timed out".to_string(),
        }));
        let event = BrokerEvent::PlanTimeout(PlanTimeoutEvent {
            plan_id: plan_id.to_string(),
        });
        let _ = self.tx_event.send(event).await;
    }
}
