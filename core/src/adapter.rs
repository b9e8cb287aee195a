// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Facade the agent runtime talks to.
//!
//! One adapter per agent query. It owns the query's effective permission
//! mode: any number of concurrent `decide_tool` calls read it, and only plan
//! approval mutates it.

use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use toolgate_protocol::InputMap;
use toolgate_protocol::PermissionMode;
use tracing::debug;

use crate::error::Result;
use crate::permission::PermissionManager;
use crate::permission::PermissionResult;
use crate::plan::PlanApprovalManager;

/// Tools auto-approved under `AcceptEdits`.
const ACCEPT_EDITS_TOOLS: &[&str] = &["Read", "Write", "Edit"];

/// Tools an agent may use while planning. Everything else is denied outright
/// in plan mode, without prompting.
const PLAN_MODE_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "Task",
    "ExitPlanMode",
    "TodoRead",
    "TodoWrite",
    "AskUserQuestion",
    "WebFetch",
    "WebSearch",
];

const EXIT_PLAN_TOOL: &str = "ExitPlanMode";

pub struct AgentAdapter {
    permissions: Arc<PermissionManager>,
    plans: Arc<PlanApprovalManager>,
    session_id: Option<String>,
    mode: Mutex<PermissionMode>,
}

impl AgentAdapter {
    pub(crate) fn new(
        permissions: Arc<PermissionManager>,
        plans: Arc<PlanApprovalManager>,
        session_id: Option<String>,
        mode: PermissionMode,
    ) -> Self {
        Self {
            permissions,
            plans,
            session_id,
            mode: Mutex::new(mode),
        }
    }

    pub fn permission_mode(&self) -> PermissionMode {
        *self.mode.lock().unwrap()
    }

    pub fn set_permission_mode(&self, mode: PermissionMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Gate one proposed tool invocation.
    ///
    /// Mode short-circuits run first; anything that survives them is queued
    /// with the permission manager and suspends until a human (or a timeout)
    /// settles it.
    pub async fn decide_tool(
        &self,
        tool_name: &str,
        input: InputMap,
        cancel: CancellationToken,
    ) -> Result<PermissionResult> {
        let mode = self.permission_mode();
        if mode == PermissionMode::BypassPermissions {
            return Ok(PermissionResult::Allow {
                updated_input: input,
            });
        }

        if tool_name == EXIT_PLAN_TOOL {
            let plan = input.get("plan").and_then(Value::as_str).map(str::to_owned);
            if let Some(plan) = plan {
                // A rejected plan propagates as an error; the runtime aborts
                // the query. The tool call itself is allowed on approval.
                let approved = self.decide_plan(&plan).await?;
                debug!(%approved, "plan approved; effective mode updated");
                return Ok(PermissionResult::Allow {
                    updated_input: input,
                });
            }
        }

        match mode {
            PermissionMode::AcceptEdits if ACCEPT_EDITS_TOOLS.contains(&tool_name) => {
                return Ok(PermissionResult::Allow {
                    updated_input: input,
                });
            }
            PermissionMode::Plan if !PLAN_MODE_TOOLS.contains(&tool_name) => {
                return Ok(PermissionResult::Deny {
                    message: format!("{tool_name} is not allowed in plan mode"),
                    interrupt: false,
                });
            }
            _ => {}
        }

        Arc::clone(&self.permissions)
            .add_request(tool_name, input, self.session_id.clone(), cancel)
            .await
    }

    /// Gate a whole plan. On approval the query's effective mode flips to
    /// whatever the user picked; rejection and timeout leave it untouched.
    pub async fn decide_plan(&self, content: &str) -> Result<PermissionMode> {
        let outcome = Arc::clone(&self.plans)
            .request_approval(content.to_string(), self.session_id.clone())
            .await?;
        self.set_permission_mode(outcome.permission_mode);
        Ok(outcome.permission_mode)
    }
}
