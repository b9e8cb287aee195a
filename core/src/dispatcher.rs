// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Session-aware fan-out between the managers and connected clients.
//!
//! The dispatcher owns every `Client`; the managers own every request. The
//! two meet only here: manager events flow out over a bounded channel, and
//! validated client frames flow back in through `handle_frame`. A slow or
//! dead client must never stall another, so each client gets its own mpsc
//! sender plus a bounded drop-oldest overflow queue.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Instant;

use async_channel::Receiver;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use toolgate_protocol::ClientMessage;
use toolgate_protocol::PermissionErrorMsg;
use toolgate_protocol::PermissionMode;
use toolgate_protocol::PermissionRequestMsg;
use toolgate_protocol::PermissionResponseMsg;
use toolgate_protocol::PlanApprovalRequestMsg;
use toolgate_protocol::PlanDecision;
use toolgate_protocol::QueueStatusMsg;
use toolgate_protocol::ServerMessage;
use toolgate_protocol::parse_client_message;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::BrokerConfig;
use crate::events::BrokerEvent;
use crate::events::PermissionCancelledEvent;
use crate::events::PermissionRequestEvent;
use crate::events::PermissionTimeoutEvent;
use crate::events::PlanRequestEvent;
use crate::events::PlanTimeoutEvent;
use crate::permission::PermissionManager;
use crate::plan::PlanApprovalManager;
use crate::util::now_ms;

/// What a client's transport task reads from its channel. `Ping` and `Close`
/// map onto whatever the transport natively offers.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Payload(ServerMessage),
    Ping,
    Close,
}

struct Client {
    session_id: Option<String>,
    alive: bool,
    last_seen: Instant,
    /// Requests this client has been told about and has not yet answered.
    pending_request_ids: HashSet<String>,
    /// Overflow for frames that did not fit the channel; strictly bounded,
    /// oldest dropped first.
    outbound_queue: VecDeque<ServerMessage>,
    tx: mpsc::Sender<OutboundMessage>,
}

pub struct Dispatcher {
    config: BrokerConfig,
    permissions: Arc<PermissionManager>,
    plans: Arc<PlanApprovalManager>,
    sequence_number: AtomicU64,
    no_client_drops: AtomicU64,
    clients: Mutex<HashMap<String, Client>>,
}

impl Dispatcher {
    pub fn new(
        config: BrokerConfig,
        permissions: Arc<PermissionManager>,
        plans: Arc<PlanApprovalManager>,
    ) -> Self {
        Self {
            config,
            permissions,
            plans,
            sequence_number: AtomicU64::new(0),
            no_client_drops: AtomicU64::new(0),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Register a client connection. Reconnecting under the same id replaces
    /// the previous registration.
    pub fn connect(
        &self,
        client_id: &str,
        session_id: Option<String>,
        tx: mpsc::Sender<OutboundMessage>,
    ) {
        {
            let mut clients = self.clients.lock().unwrap();
            let replaced = clients
                .insert(
                    client_id.to_string(),
                    Client {
                        session_id,
                        alive: true,
                        last_seen: Instant::now(),
                        pending_request_ids: HashSet::new(),
                        outbound_queue: VecDeque::new(),
                        tx,
                    },
                )
                .is_some();
            if replaced {
                info!(client_id, "client reconnected, replacing registration");
            } else {
                info!(client_id, "client connected");
            }
        }
        self.broadcast_queue_status();
    }

    /// Remove a client. Its pending requests stay queued in the manager;
    /// another client, the timeout, or a cancellation settles them.
    pub fn disconnect(&self, client_id: &str) {
        let removed = self.clients.lock().unwrap().remove(client_id);
        let Some(client) = removed else {
            return;
        };
        info!(client_id, "client disconnected");
        for request_id in &client.pending_request_ids {
            info!(client_id, request_id = %request_id, "request still pending after client disconnect");
        }
    }

    /// Transport-level pong. Marks the client alive and drains anything that
    /// queued up while its channel was full.
    pub fn record_pong(&self, client_id: &str) {
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get_mut(client_id) {
            client.alive = true;
            client.last_seen = Instant::now();
            Self::flush_queued(client);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Permission requests that found no connected client at all.
    pub fn no_client_drops(&self) -> u64 {
        self.no_client_drops.load(Ordering::Relaxed)
    }

    /// Parse and handle one inbound frame. Malformed frames earn the sender
    /// a targeted error and nothing else.
    pub async fn handle_frame(&self, client_id: &str, raw: &str) {
        match parse_client_message(raw) {
            Ok(msg) => self.handle_client_message(client_id, msg),
            Err(e) => {
                warn!(client_id, "malformed client frame: {e}");
                self.send_error(client_id, None, format!("Invalid message: {e}"));
            }
        }
    }

    pub fn handle_client_message(&self, client_id: &str, msg: ClientMessage) {
        match msg {
            ClientMessage::PermissionResponse(msg) => {
                self.handle_permission_response(client_id, msg);
            }
            ClientMessage::PermissionSyncRequest { session_id } => {
                self.handle_sync_request(client_id, session_id);
            }
            ClientMessage::PlanApprovalResponse(msg) => {
                if msg.decision == PlanDecision::Approve
                    && !matches!(
                        msg.permission_mode,
                        Some(PermissionMode::Default | PermissionMode::AcceptEdits)
                    )
                {
                    self.send_error(
                        client_id,
                        None,
                        "Plan approval requires permissionMode 'default' or 'acceptEdits'",
                    );
                    return;
                }
                if !self
                    .plans
                    .resolve(&msg.plan_id, msg.decision, msg.permission_mode, msg.reason)
                {
                    self.send_error(client_id, None, "Plan not found or already resolved");
                }
            }
            ClientMessage::Pong { .. } => self.record_pong(client_id),
        }
    }

    fn handle_permission_response(&self, client_id: &str, msg: PermissionResponseMsg) {
        let verdict: std::result::Result<(), &str> = {
            let mut clients = self.clients.lock().unwrap();
            let Some(client) = clients.get_mut(client_id) else {
                warn!(client_id, "permission response from unknown client");
                return;
            };

            // Ownership first: a client bound to one session must never
            // settle another session's request, whatever its pending set
            // claims. This check is the only defense against one client
            // answering another's prompts.
            let owner = self.permissions.request_session(&msg.request_id);
            match owner {
                Some(Some(ref request_session))
                    if client
                        .session_id
                        .as_deref()
                        .is_some_and(|client_session| client_session != request_session) =>
                {
                    warn!(
                        client_id,
                        request_id = %msg.request_id,
                        "rejected cross-session permission response"
                    );
                    Err("Unauthorized: session mismatch")
                }
                _ if !client.pending_request_ids.contains(&msg.request_id) => {
                    Err("Request not found in your pending queue")
                }
                _ => {
                    client.pending_request_ids.remove(&msg.request_id);
                    Ok(())
                }
            }
        };

        if let Err(error) = verdict {
            self.send_error(client_id, Some(msg.request_id), error);
            return;
        }

        if !self
            .permissions
            .resolve(&msg.request_id, msg.decision, msg.updated_input)
        {
            self.send_error(
                client_id,
                Some(msg.request_id),
                "Request not found or already resolved",
            );
        }
        self.broadcast_queue_status();
    }

    /// Serve the post-reconnect sync: bind the client to the session it
    /// declares, hand it that session's pending requests, and let it answer
    /// them.
    fn handle_sync_request(&self, client_id: &str, session_id: String) {
        let pending = self.permissions.requests_for_session(&session_id);
        let mut clients = self.clients.lock().unwrap();
        let Some(client) = clients.get_mut(client_id) else {
            warn!(client_id, "sync request from unknown client");
            return;
        };
        client.session_id = Some(session_id.clone());
        client
            .pending_request_ids
            .extend(pending.iter().map(|summary| summary.id.clone()));
        debug!(
            client_id,
            session_id = %session_id,
            pending = pending.len(),
            "answering permission sync request"
        );
        let msg = ServerMessage::PermissionSyncResponse {
            session_id,
            pending_requests: pending,
        };
        self.deliver(client, msg);
    }

    /// Consume manager events until shutdown or channel close.
    pub async fn run(self: Arc<Self>, rx_event: Receiver<BrokerEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx_event.recv() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(_) => break,
                },
            }
        }
        debug!("dispatcher event loop exited");
    }

    fn handle_event(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::PermissionRequest(ev) => self.fan_out_permission_request(ev),
            BrokerEvent::PermissionTimeout(ev) => self.fan_out_permission_timeout(ev),
            BrokerEvent::PermissionCancelled(ev) => self.fan_out_permission_cancelled(ev),
            BrokerEvent::PlanRequest(ev) => self.fan_out_plan_request(ev),
            BrokerEvent::PlanTimeout(ev) => self.fan_out_plan_timeout(ev),
        }
    }

    /// Deliver a new request to the clients allowed to answer it: those
    /// bound to the owning session, plus unbound clients. The inbound
    /// ownership check stays authoritative either way.
    fn fan_out_permission_request(&self, ev: PermissionRequestEvent) {
        let payload = PermissionRequestMsg {
            id: ev.id.clone(),
            tool_name: ev.tool_name,
            input: ev.input,
            summary: ev.summary,
            risk_level: ev.risk_level,
            category: ev.category,
            timestamp: ev.created_at,
            expires_at: ev.expires_at,
            session_id: ev.session_id.clone(),
            sequence_number: self.next_sequence(),
        };

        let mut clients = self.clients.lock().unwrap();
        if clients.is_empty() {
            self.no_client_drops.fetch_add(1, Ordering::Relaxed);
            warn!(
                request_id = %ev.id,
                "no connected clients for permission request; it will wait for its timeout"
            );
            return;
        }
        let mut delivered = 0;
        for client in clients.values_mut() {
            if !session_matches(client.session_id.as_deref(), ev.session_id.as_deref()) {
                continue;
            }
            client.pending_request_ids.insert(ev.id.clone());
            self.deliver(client, ServerMessage::PermissionRequest(payload.clone()));
            delivered += 1;
        }
        if delivered == 0 {
            debug!(
                request_id = %ev.id,
                session_id = ?ev.session_id,
                "no client eligible for this session; awaiting sync or timeout"
            );
        }
    }

    fn fan_out_permission_timeout(&self, ev: PermissionTimeoutEvent) {
        let msg = ServerMessage::PermissionTimeout {
            request_id: ev.request_id.clone(),
            tool_name: ev.tool_name,
            timestamp: now_ms(),
        };
        {
            let mut clients = self.clients.lock().unwrap();
            for client in clients.values_mut() {
                client.pending_request_ids.remove(&ev.request_id);
                self.deliver(client, msg.clone());
            }
        }
        self.broadcast_queue_status();
    }

    fn fan_out_permission_cancelled(&self, ev: PermissionCancelledEvent) {
        let msg = ServerMessage::PermissionCancelled {
            request_id: ev.request_id.clone(),
            reason: ev.reason,
            timestamp: now_ms(),
        };
        {
            let mut clients = self.clients.lock().unwrap();
            for client in clients.values_mut() {
                client.pending_request_ids.remove(&ev.request_id);
                self.deliver(client, msg.clone());
            }
        }
        self.broadcast_queue_status();
    }

    fn fan_out_plan_request(&self, ev: PlanRequestEvent) {
        let msg = ServerMessage::PlanApprovalRequest(PlanApprovalRequestMsg {
            plan_id: ev.plan_id,
            content: ev.content,
            session_id: ev.session_id,
            timestamp: ev.created_at,
            expires_at: ev.expires_at,
            sequence_number: self.next_sequence(),
        });
        let mut clients = self.clients.lock().unwrap();
        for client in clients.values_mut() {
            self.deliver(client, msg.clone());
        }
    }

    fn fan_out_plan_timeout(&self, ev: PlanTimeoutEvent) {
        let msg = ServerMessage::PlanApprovalTimeout {
            plan_id: ev.plan_id,
            timestamp: now_ms(),
        };
        let mut clients = self.clients.lock().unwrap();
        for client in clients.values_mut() {
            self.deliver(client, msg.clone());
        }
    }

    /// Dead-man heartbeat. A client that fails to pong for a full interval
    /// is removed exactly as if it had disconnected.
    pub async fn run_heartbeat(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.heartbeat_tick(),
            }
        }
        debug!("dispatcher heartbeat exited");
    }

    fn heartbeat_tick(&self) {
        let dead: Vec<(String, Client)> = {
            let mut clients = self.clients.lock().unwrap();
            let dead_ids: Vec<String> = clients
                .iter()
                .filter(|(_, client)| !client.alive)
                .map(|(id, _)| id.clone())
                .collect();
            let dead: Vec<(String, Client)> = dead_ids
                .into_iter()
                .filter_map(|id| clients.remove(&id).map(|client| (id, client)))
                .collect();
            for client in clients.values_mut() {
                client.alive = false;
                let _ = client.tx.try_send(OutboundMessage::Ping);
                Self::flush_queued(client);
            }
            dead
        };
        for (client_id, client) in dead {
            info!(client_id = %client_id, idle_for = ?client.last_seen.elapsed(), "client missed heartbeat, removing");
            for request_id in &client.pending_request_ids {
                info!(client_id = %client_id, request_id = %request_id, "request still pending after heartbeat removal");
            }
        }
    }

    /// Close every client with a normal-close indication. Used at shutdown.
    pub fn close_all(&self) {
        let mut clients = self.clients.lock().unwrap();
        for (client_id, client) in clients.drain() {
            debug!(client_id = %client_id, "closing client");
            let _ = client.tx.try_send(OutboundMessage::Close);
        }
    }

    fn broadcast_queue_status(&self) {
        let pending = self.permissions.queue_len();
        let msg = QueueStatusMsg {
            pending,
            // The broker gates invocations but never executes them, so
            // nothing is ever mid-execution here.
            processing: 0,
            timestamp: now_ms(),
        };
        let mut clients = self.clients.lock().unwrap();
        for client in clients.values_mut() {
            self.deliver(client, ServerMessage::PermissionQueueStatus(msg.clone()));
        }
    }

    fn send_error(&self, client_id: &str, request_id: Option<String>, error: impl Into<String>) {
        let msg = ServerMessage::PermissionError(PermissionErrorMsg {
            request_id,
            error: error.into(),
            timestamp: now_ms(),
        });
        self.send_to(client_id, msg);
    }

    fn send_to(&self, client_id: &str, msg: ServerMessage) {
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get_mut(client_id) {
            self.deliver(client, msg);
        }
    }

    /// Send with overflow. Queued frames drain first so per-client ordering
    /// follows sequence numbers.
    fn deliver(&self, client: &mut Client, msg: ServerMessage) {
        Self::flush_queued(client);
        if !client.outbound_queue.is_empty() {
            self.enqueue(client, msg);
            return;
        }
        match client.tx.try_send(OutboundMessage::Payload(msg)) {
            Ok(()) => {}
            Err(TrySendError::Full(OutboundMessage::Payload(msg))) => self.enqueue(client, msg),
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => {
                debug!("client channel closed; heartbeat will reap it");
            }
        }
    }

    fn enqueue(&self, client: &mut Client, msg: ServerMessage) {
        while client.outbound_queue.len() >= self.config.max_queued_per_client {
            client.outbound_queue.pop_front();
        }
        client.outbound_queue.push_back(msg);
    }

    fn flush_queued(client: &mut Client) {
        while let Some(msg) = client.outbound_queue.pop_front() {
            match client.tx.try_send(OutboundMessage::Payload(msg)) {
                Ok(()) => continue,
                Err(TrySendError::Full(OutboundMessage::Payload(msg))) => {
                    client.outbound_queue.push_front(msg);
                    break;
                }
                Err(_) => break,
            }
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence_number.fetch_add(1, Ordering::Relaxed)
    }
}

/// A client may see a request when either side is unbound or the sessions
/// agree. The inbound ownership check re-validates before any resolution.
fn session_matches(client_session: Option<&str>, request_session: Option<&str>) -> bool {
    match (client_session, request_session) {
        (Some(client), Some(request)) => client == request,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::session_cache::SessionPermissionCache;
    use std::time::Duration;

    fn test_dispatcher(max_queued_per_client: usize) -> Arc<Dispatcher> {
        let config = BrokerConfig {
            max_queued_per_client,
            ..BrokerConfig::default()
        };
        let (tx_event, _rx_event) = async_channel::bounded(16);
        let cache = SessionPermissionCache::new(16, Duration::from_secs(60));
        let permissions = Arc::new(PermissionManager::new(
            config.clone(),
            cache,
            tx_event.clone(),
        ));
        let plans = Arc::new(PlanApprovalManager::new(config.clone(), tx_event));
        Arc::new(Dispatcher::new(config, permissions, plans))
    }

    #[test]
    fn session_matching_rules() {
        assert!(session_matches(Some("S1"), Some("S1")));
        assert!(!session_matches(Some("S1"), Some("S2")));
        assert!(session_matches(None, Some("S1")));
        assert!(session_matches(Some("S1"), None));
        assert!(session_matches(None, None));
    }

    #[tokio::test]
    async fn outbound_queue_is_bounded_drop_oldest() {
        let dispatcher = test_dispatcher(2);
        let (tx, _rx) = mpsc::channel(1);
        dispatcher.connect("c1", None, tx);

        // Channel capacity 1 absorbs a single frame (queue status from
        // connect); everything else overflows into the bounded queue.
        for n in 0..5 {
            dispatcher.send_to(
                "c1",
                ServerMessage::PermissionTimeout {
                    request_id: format!("R{n}"),
                    tool_name: "Read".to_string(),
                    timestamp: 0,
                },
            );
        }

        let clients = dispatcher.clients.lock().unwrap();
        let client = clients.get("c1").unwrap();
        assert_eq!(client.outbound_queue.len(), 2);
        // Oldest were dropped: the survivors are the most recent frames.
        let ids: Vec<String> = client
            .outbound_queue
            .iter()
            .map(|msg| match msg {
                ServerMessage::PermissionTimeout { request_id, .. } => request_id.clone(),
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["R3".to_string(), "R4".to_string()]);
    }

    #[tokio::test]
    async fn queued_frames_flush_on_pong() {
        let dispatcher = test_dispatcher(8);
        let (tx, mut rx) = mpsc::channel(1);
        dispatcher.connect("c1", None, tx);

        for n in 0..3 {
            dispatcher.send_to(
                "c1",
                ServerMessage::PlanApprovalTimeout {
                    plan_id: format!("P{n}"),
                    timestamp: 0,
                },
            );
        }
        // Drain the transport and pong; queued frames follow in order.
        let mut received = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            received.push(msg);
        }
        dispatcher.record_pong("c1");
        while let Ok(msg) = rx.try_recv() {
            received.push(msg);
        }
        dispatcher.record_pong("c1");
        while let Ok(msg) = rx.try_recv() {
            received.push(msg);
        }
        assert!(received.len() >= 3);
    }

    #[tokio::test]
    async fn heartbeat_removes_silent_clients() {
        let dispatcher = test_dispatcher(4);
        let (tx, _rx) = mpsc::channel(4);
        dispatcher.connect("c1", Some("S1".to_string()), tx);
        assert_eq!(dispatcher.client_count(), 1);

        // First tick clears the alive flag; second removes the client.
        dispatcher.heartbeat_tick();
        assert_eq!(dispatcher.client_count(), 1);
        dispatcher.heartbeat_tick();
        assert_eq!(dispatcher.client_count(), 0);

        // A client that pongs in between survives.
        let (tx, _rx) = mpsc::channel(4);
        dispatcher.connect("c2", None, tx);
        dispatcher.heartbeat_tick();
        dispatcher.record_pong("c2");
        dispatcher.heartbeat_tick();
        assert_eq!(dispatcher.client_count(), 1);
    }

    #[tokio::test]
    async fn unknown_request_earns_a_targeted_error() {
        let dispatcher = test_dispatcher(4);
        let (tx, mut rx) = mpsc::channel(8);
        dispatcher.connect("c1", Some("S1".to_string()), tx);
        // Drain the connect-time queue status.
        let _ = rx.try_recv();

        dispatcher
            .handle_frame(
                "c1",
                r#"{"type":"permission-response","requestId":"nope","decision":"allow"}"#,
            )
            .await;

        let frame = rx.try_recv().unwrap();
        let OutboundMessage::Payload(ServerMessage::PermissionError(err)) = frame else {
            panic!("expected permission-error, got {frame:?}");
        };
        assert_eq!(err.request_id.as_deref(), Some("nope"));
        assert_eq!(err.error, "Request not found in your pending queue");
    }
}
