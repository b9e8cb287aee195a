// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Queue of pending tool-authorization requests.
//!
//! `add_request` suspends the calling agent on a oneshot until the request
//! reaches exactly one terminal state: user decision, timeout, agent
//! cancellation, session drop, or shutdown. The serialization point is
//! removal from `pending` under the state mutex; whichever path removes the
//! entry wins and every later path is a no-op.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use async_channel::Sender;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use toolgate_protocol::InputMap;
use toolgate_protocol::PendingRequestSummary;
use toolgate_protocol::UserDecision;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::BrokerErr;
use crate::error::Result;
use crate::events::BrokerEvent;
use crate::events::PermissionCancelledEvent;
use crate::events::PermissionRequestEvent;
use crate::events::PermissionTimeoutEvent;
use crate::risk::assess_tool_risk;
use crate::session_cache::SessionPermissionCache;
use crate::util::now_ms;

/// What the agent runtime gets back. An `Allow` always carries the input to
/// run with: the user's edited version when present, the original otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionResult {
    Allow { updated_input: InputMap },
    Deny { message: String, interrupt: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PermissionStats {
    pub total: u64,
    pub approved: u64,
    pub denied: u64,
    pub timed_out: u64,
    pub aborted: u64,
}

struct PendingRequest {
    tool_name: String,
    input: InputMap,
    session_id: Option<String>,
    created_at: i64,
    created: Instant,
    tx: oneshot::Sender<Result<PermissionResult>>,
    timer: AbortHandle,
    cancel_listener: AbortHandle,
}

#[derive(Default)]
struct ManagerState {
    pending: HashMap<String, PendingRequest>,
    by_session: HashMap<String, HashSet<String>>,
    stats: PermissionStats,
}

pub struct PermissionManager {
    config: BrokerConfig,
    cache: SessionPermissionCache,
    tx_event: Sender<BrokerEvent>,
    state: Mutex<ManagerState>,
}

impl PermissionManager {
    pub fn new(
        config: BrokerConfig,
        cache: SessionPermissionCache,
        tx_event: Sender<BrokerEvent>,
    ) -> Self {
        Self {
            config,
            cache,
            tx_event,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Register a tool invocation and suspend until it reaches a terminal
    /// state.
    ///
    /// The cache is consulted after the queue-full check and before any event
    /// is emitted; a hit resolves synchronously and generates no outbound
    /// traffic.
    pub async fn add_request(
        self: Arc<Self>,
        tool_name: &str,
        input: InputMap,
        session_id: Option<String>,
        cancel: CancellationToken,
    ) -> Result<PermissionResult> {
        let assessment = assess_tool_risk(tool_name, &input);
        let (id, rx, event) = {
            let mut state = self.state.lock().unwrap();
            if state.pending.len() >= self.config.max_queue_size {
                warn!(
                    pending = state.pending.len(),
                    tool_name, "permission queue is full"
                );
                return Err(BrokerErr::QueueFull);
            }

            if let Some(session) = session_id.as_deref()
                && let Some(decision) = self.cache.lookup(session, tool_name, &input)
            {
                debug!(tool_name, session, %decision, "session cache hit");
                state.stats.total += 1;
                state.stats.approved += 1;
                return Ok(PermissionResult::Allow {
                    updated_input: input,
                });
            }

            let id = Uuid::new_v4().to_string();
            let created_at = now_ms();
            let expires_at = created_at + self.config.permission_timeout.as_millis() as i64;
            let (tx, rx) = oneshot::channel();

            let timer = tokio::spawn({
                let this = Arc::clone(&self);
                let id = id.clone();
                async move {
                    tokio::time::sleep(this.config.permission_timeout).await;
                    this.handle_timeout(&id).await;
                }
            })
            .abort_handle();
            let cancel_listener = tokio::spawn({
                let this = Arc::clone(&self);
                let id = id.clone();
                async move {
                    cancel.cancelled().await;
                    this.handle_cancel(&id).await;
                }
            })
            .abort_handle();

            state.pending.insert(
                id.clone(),
                PendingRequest {
                    tool_name: tool_name.to_string(),
                    input: input.clone(),
                    session_id: session_id.clone(),
                    created_at,
                    created: Instant::now(),
                    tx,
                    timer,
                    cancel_listener,
                },
            );
            if let Some(session) = &session_id {
                state
                    .by_session
                    .entry(session.clone())
                    .or_default()
                    .insert(id.clone());
            }
            state.stats.total += 1;

            let event = BrokerEvent::PermissionRequest(PermissionRequestEvent {
                id: id.clone(),
                tool_name: tool_name.to_string(),
                input,
                summary: assessment.summary,
                risk_level: assessment.level,
                category: assessment.category,
                session_id,
                created_at,
                expires_at,
            });
            (id, rx, event)
        };

        if self.tx_event.send(event).await.is_err() {
            debug!(request_id = %id, "event channel closed; request will resolve by timeout");
        }

        match rx.await {
            Ok(outcome) => outcome,
            // Sender dropped without a decision: the session went away.
            Err(_) => Err(BrokerErr::SessionClosed),
        }
    }

    /// Settle a pending request with a user decision. Returns `false` when
    /// the request is unknown or already settled; repeated calls are no-ops.
    pub fn resolve(
        &self,
        request_id: &str,
        decision: UserDecision,
        updated_input: Option<InputMap>,
    ) -> bool {
        let Some(entry) = self.take_entry(request_id) else {
            debug!(request_id, "resolve for unknown or already settled request");
            return false;
        };
        entry.timer.abort();
        entry.cancel_listener.abort();

        if decision.caches_for_session()
            && let Some(session) = entry.session_id.as_deref()
        {
            self.cache
                .store(session, &entry.tool_name, &entry.input, decision);
        }

        let result = if decision.is_allow() {
            PermissionResult::Allow {
                updated_input: updated_input.unwrap_or(entry.input),
            }
        } else {
            PermissionResult::Deny {
                message: "Permission denied by user".to_string(),
                interrupt: false,
            }
        };

        {
            let mut state = self.state.lock().unwrap();
            if decision.is_allow() {
                state.stats.approved += 1;
            } else {
                state.stats.denied += 1;
            }
        }

        info!(request_id, %decision, tool_name = %entry.tool_name, "permission request resolved");
        if entry.tx.send(Ok(result)).is_err() {
            debug!(request_id, "caller went away before the decision arrived");
        }
        true
    }

    /// Session owner of a pending request; outer `None` when the request is
    /// unknown. Used by the dispatcher's ownership check.
    pub fn request_session(&self, request_id: &str) -> Option<Option<String>> {
        let state = self.state.lock().unwrap();
        state
            .pending
            .get(request_id)
            .map(|entry| entry.session_id.clone())
    }

    /// Pending requests owned by a session, for the sync protocol.
    pub fn requests_for_session(&self, session_id: &str) -> Vec<PendingRequestSummary> {
        let state = self.state.lock().unwrap();
        let Some(ids) = state.by_session.get(session_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| state.pending.get(id).map(|entry| (id, entry)))
            .map(|(id, entry)| PendingRequestSummary {
                id: id.clone(),
                tool_name: entry.tool_name.clone(),
                input: entry.input.clone(),
                timestamp: entry.created_at,
                session_id: entry.session_id.clone(),
            })
            .collect()
    }

    /// Abandon every request owned by a session and forget its cached
    /// decisions. Waiting callers wake with a session-closed error.
    pub fn drop_session(&self, session_id: &str) {
        let entries: Vec<PendingRequest> = {
            let mut state = self.state.lock().unwrap();
            let ids = state.by_session.remove(session_id).unwrap_or_default();
            let entries: Vec<PendingRequest> = ids
                .iter()
                .filter_map(|id| state.pending.remove(id))
                .collect();
            state.stats.aborted += entries.len() as u64;
            entries
        };
        if !entries.is_empty() {
            info!(
                session_id,
                dropped = entries.len(),
                "dropping pending requests for closed session"
            );
        }
        for entry in entries {
            entry.timer.abort();
            entry.cancel_listener.abort();
            // Dropping `tx` wakes the caller with SessionClosed.
        }
        self.cache.drop_session(session_id);
    }

    /// Force-time-out requests that somehow outlived their timer. A hit
    /// here means a timer task died.
    pub async fn sweep_expired(&self) {
        let stale_after = self.config.permission_timeout * 2;
        let stale: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .pending
                .iter()
                .filter(|(_, entry)| entry.created.elapsed() > stale_after)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in stale {
            warn!(request_id = %id, "cleanup sweep found a request past its deadline");
            self.handle_timeout(&id).await;
        }
    }

    /// Abort every pending request with a shutdown error.
    pub fn shutdown(&self) {
        let entries: Vec<PendingRequest> = {
            let mut state = self.state.lock().unwrap();
            state.by_session.clear();
            state.pending.drain().map(|(_, entry)| entry).collect()
        };
        if !entries.is_empty() {
            info!(aborted = entries.len(), "permission manager shutting down");
        }
        for entry in entries {
            entry.timer.abort();
            entry.cancel_listener.abort();
            let _ = entry.tx.send(Err(BrokerErr::Shutdown));
        }
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn stats(&self) -> PermissionStats {
        self.state.lock().unwrap().stats
    }

    async fn handle_timeout(&self, request_id: &str) {
        let Some(entry) = self.take_entry(request_id) else {
            return;
        };
        entry.cancel_listener.abort();
        {
            let mut state = self.state.lock().unwrap();
            state.stats.timed_out += 1;
        }
        info!(request_id, tool_name = %entry.tool_name, "permission request timed out");
        let _ = entry.tx.send(Ok(PermissionResult::Deny {
            message: "Request timed out".to_string(),
            interrupt: false,
        }));
        let event = BrokerEvent::PermissionTimeout(PermissionTimeoutEvent {
            request_id: request_id.to_string(),
            tool_name: entry.tool_name,
        });
        let _ = self.tx_event.send(event).await;
    }

    async fn handle_cancel(&self, request_id: &str) {
        let Some(entry) = self.take_entry(request_id) else {
            return;
        };
        entry.timer.abort();
        {
            let mut state = self.state.lock().unwrap();
            state.stats.aborted += 1;
        }
        info!(request_id, tool_name = %entry.tool_name, "permission request cancelled by agent");
        let _ = entry.tx.send(Err(BrokerErr::Interrupted));
        let event = BrokerEvent::PermissionCancelled(PermissionCancelledEvent {
            request_id: request_id.to_string(),
            reason: "cancelled by agent".to_string(),
        });
        let _ = self.tx_event.send(event).await;
    }

    /// The single removal point that decides which terminal path wins.
    fn take_entry(&self, request_id: &str) -> Option<PendingRequest> {
        let mut state = self.state.lock().unwrap();
        let entry = state.pending.remove(request_id)?;
        if let Some(session) = &entry.session_id
            && let Some(ids) = state.by_session.get_mut(session)
        {
            ids.remove(request_id);
            if ids.is_empty() {
                state.by_session.remove(session);
            }
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BrokerEvent;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn test_config(timeout: Duration) -> BrokerConfig {
        BrokerConfig {
            permission_timeout: timeout,
            max_queue_size: 3,
            cache_max_per_session: 16,
            cache_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(60),
            max_queued_per_client: 4,
            cleanup_interval: Duration::from_secs(60),
        }
    }

    fn test_manager(
        timeout: Duration,
    ) -> (Arc<PermissionManager>, async_channel::Receiver<BrokerEvent>) {
        let (tx_event, rx_event) = async_channel::bounded(32);
        let config = test_config(timeout);
        let cache = SessionPermissionCache::new(config.cache_max_per_session, config.cache_ttl);
        (
            Arc::new(PermissionManager::new(config, cache, tx_event)),
            rx_event,
        )
    }

    fn read_input() -> InputMap {
        let mut input = InputMap::new();
        input.insert("file_path".to_string(), json!("/etc/hosts"));
        input
    }

    async fn next_request_id(rx: &async_channel::Receiver<BrokerEvent>) -> String {
        loop {
            match rx.recv().await.unwrap() {
                BrokerEvent::PermissionRequest(ev) => return ev.id,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn allow_returns_original_input() {
        let (manager, rx_event) = test_manager(Duration::from_secs(5));
        let task = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move {
                manager
                    .add_request(
                        "Read",
                        read_input(),
                        Some("S1".to_string()),
                        CancellationToken::new(),
                    )
                    .await
            }
        });

        let id = next_request_id(&rx_event).await;
        assert!(manager.resolve(&id, UserDecision::Allow, None));
        let result = task.await.unwrap().unwrap();
        assert_eq!(
            result,
            PermissionResult::Allow {
                updated_input: read_input()
            }
        );
        assert_eq!(manager.queue_len(), 0);
    }

    #[tokio::test]
    async fn updated_input_replaces_the_original() {
        let (manager, rx_event) = test_manager(Duration::from_secs(5));
        let task = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move {
                manager
                    .add_request(
                        "Write",
                        read_input(),
                        Some("S1".to_string()),
                        CancellationToken::new(),
                    )
                    .await
            }
        });

        let id = next_request_id(&rx_event).await;
        let mut edited = InputMap::new();
        edited.insert("file_path".to_string(), json!("/tmp/other"));
        assert!(manager.resolve(&id, UserDecision::Allow, Some(edited.clone())));
        let result = task.await.unwrap().unwrap();
        assert_eq!(
            result,
            PermissionResult::Allow {
                updated_input: edited
            }
        );
    }

    #[tokio::test]
    async fn resolve_is_first_wins() {
        let (manager, rx_event) = test_manager(Duration::from_secs(5));
        let task = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move {
                manager
                    .add_request(
                        "Read",
                        read_input(),
                        Some("S1".to_string()),
                        CancellationToken::new(),
                    )
                    .await
            }
        });

        let id = next_request_id(&rx_event).await;
        assert!(manager.resolve(&id, UserDecision::Deny, None));
        assert!(!manager.resolve(&id, UserDecision::Allow, None));
        let result = task.await.unwrap().unwrap();
        assert!(matches!(result, PermissionResult::Deny { .. }));
        let stats = manager.stats();
        assert_eq!(stats.denied, 1);
        assert_eq!(stats.approved, 0);
    }

    #[tokio::test]
    async fn queue_bound_is_enforced() {
        let (manager, rx_event) = test_manager(Duration::from_secs(5));
        let mut tasks = Vec::new();
        for _ in 0..3 {
            tasks.push(tokio::spawn({
                let manager = Arc::clone(&manager);
                async move {
                    manager
                        .add_request("Read", read_input(), None, CancellationToken::new())
                        .await
                }
            }));
        }
        for _ in 0..3 {
            next_request_id(&rx_event).await;
        }
        assert_eq!(manager.queue_len(), 3);

        let overflow = Arc::clone(&manager)
            .add_request("Read", read_input(), None, CancellationToken::new())
            .await;
        assert!(matches!(overflow, Err(BrokerErr::QueueFull)));

        manager.shutdown();
        for task in tasks {
            assert!(matches!(task.await.unwrap(), Err(BrokerErr::Shutdown)));
        }
    }

    #[tokio::test]
    async fn timeout_resolves_once_with_deny() {
        let (manager, rx_event) = test_manager(Duration::from_millis(50));
        let task = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move {
                manager
                    .add_request(
                        "Read",
                        read_input(),
                        Some("S1".to_string()),
                        CancellationToken::new(),
                    )
                    .await
            }
        });

        let id = next_request_id(&rx_event).await;
        let result = task.await.unwrap().unwrap();
        assert_eq!(
            result,
            PermissionResult::Deny {
                message: "Request timed out".to_string(),
                interrupt: false,
            }
        );
        // A late response is silently discarded.
        assert!(!manager.resolve(&id, UserDecision::Allow, None));
        assert_eq!(manager.stats().timed_out, 1);
        assert_eq!(manager.queue_len(), 0);

        let timed_out = loop {
            match rx_event.recv().await.unwrap() {
                BrokerEvent::PermissionTimeout(ev) => break ev.request_id,
                _ => continue,
            }
        };
        assert_eq!(timed_out, id);
    }

    #[tokio::test]
    async fn agent_cancel_is_distinct_from_deny() {
        let (manager, rx_event) = test_manager(Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let manager = Arc::clone(&manager);
            let cancel = cancel.clone();
            async move {
                manager
                    .add_request("Bash", InputMap::new(), Some("S1".to_string()), cancel)
                    .await
            }
        });

        next_request_id(&rx_event).await;
        cancel.cancel();
        assert!(matches!(
            task.await.unwrap(),
            Err(BrokerErr::Interrupted)
        ));
        assert_eq!(manager.stats().aborted, 1);
    }

    #[tokio::test]
    async fn allow_for_session_primes_the_cache() {
        let (manager, rx_event) = test_manager(Duration::from_secs(5));
        let task = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move {
                manager
                    .add_request(
                        "Read",
                        read_input(),
                        Some("S1".to_string()),
                        CancellationToken::new(),
                    )
                    .await
            }
        });
        let id = next_request_id(&rx_event).await;
        assert!(manager.resolve(&id, UserDecision::AllowSession, None));
        task.await.unwrap().unwrap();

        // Identical call resolves synchronously, with no new event.
        let result = Arc::clone(&manager)
            .add_request(
                "Read",
                read_input(),
                Some("S1".to_string()),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(result, PermissionResult::Allow { .. }));
        assert_eq!(manager.queue_len(), 0);
        assert!(rx_event.is_empty());

        // A different session still prompts.
        let other = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move {
                manager
                    .add_request(
                        "Read",
                        read_input(),
                        Some("S2".to_string()),
                        CancellationToken::new(),
                    )
                    .await
            }
        });
        let other_id = next_request_id(&rx_event).await;
        manager.resolve(&other_id, UserDecision::Deny, None);
        other.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn drop_session_wakes_callers_with_session_closed() {
        let (manager, rx_event) = test_manager(Duration::from_secs(5));
        let task = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move {
                manager
                    .add_request(
                        "Read",
                        read_input(),
                        Some("S1".to_string()),
                        CancellationToken::new(),
                    )
                    .await
            }
        });
        let id = next_request_id(&rx_event).await;
        manager.drop_session("S1");
        assert!(matches!(
            task.await.unwrap(),
            Err(BrokerErr::SessionClosed)
        ));
        assert!(!manager.resolve(&id, UserDecision::Allow, None));
        assert!(manager.requests_for_session("S1").is_empty());
    }

    #[tokio::test]
    async fn sync_snapshot_lists_only_that_session() {
        let (manager, rx_event) = test_manager(Duration::from_secs(5));
        for session in ["S1", "S2"] {
            tokio::spawn({
                let manager = Arc::clone(&manager);
                let session = session.to_string();
                async move {
                    manager
                        .add_request("Read", read_input(), Some(session), CancellationToken::new())
                        .await
                }
            });
        }
        next_request_id(&rx_event).await;
        next_request_id(&rx_event).await;

        let summaries = manager.requests_for_session("S1");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].session_id.as_deref(), Some("S1"));
        assert_eq!(summaries[0].tool_name, "Read");
        manager.shutdown();
    }
}
