//! Assembly of the broker: managers, event channel, dispatcher, and the
//! background loops.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use toolgate_protocol::PermissionMode;
use tracing::info;

use crate::adapter::AgentAdapter;
use crate::config::BrokerConfig;
use crate::dispatcher::Dispatcher;
use crate::permission::PermissionManager;
use crate::permission::PermissionStats;
use crate::plan::PlanApprovalManager;
use crate::plan::PlanStats;
use crate::session_cache::SessionPermissionCache;

/// Size of the bounded event channel between the managers and the
/// dispatcher. 128 is plenty for an interactive approval queue capped at
/// 100 pending requests.
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// The running broker. Owns the permission and plan managers, the
/// dispatcher, and the background loops (event fan-out, heartbeat, cleanup
/// sweep). Drop-in single-process; nothing is persisted.
pub struct Broker {
    permissions: Arc<PermissionManager>,
    plans: Arc<PlanApprovalManager>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

impl Broker {
    /// Wire everything up and spawn the background loops. Must be called
    /// from within a Tokio runtime.
    pub fn spawn(config: BrokerConfig) -> Self {
        let (tx_event, rx_event) = async_channel::bounded(EVENT_CHANNEL_CAPACITY);
        let cache = SessionPermissionCache::new(config.cache_max_per_session, config.cache_ttl);
        let permissions = Arc::new(PermissionManager::new(
            config.clone(),
            cache,
            tx_event.clone(),
        ));
        let plans = Arc::new(PlanApprovalManager::new(config.clone(), tx_event));
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            Arc::clone(&permissions),
            Arc::clone(&plans),
        ));
        let shutdown = CancellationToken::new();

        tokio::spawn(Arc::clone(&dispatcher).run(rx_event, shutdown.child_token()));
        tokio::spawn(Arc::clone(&dispatcher).run_heartbeat(shutdown.child_token()));
        tokio::spawn({
            let permissions = Arc::clone(&permissions);
            let shutdown = shutdown.child_token();
            let cleanup_interval = config.cleanup_interval;
            async move {
                let mut ticker = tokio::time::interval(cleanup_interval);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => permissions.sweep_expired().await,
                    }
                }
            }
        });

        Self {
            permissions,
            plans,
            dispatcher,
            shutdown,
        }
    }

    /// Facade for one agent query. The adapter owns that query's effective
    /// permission mode.
    pub fn adapter(&self, session_id: Option<String>, mode: PermissionMode) -> AgentAdapter {
        AgentAdapter::new(
            Arc::clone(&self.permissions),
            Arc::clone(&self.plans),
            session_id,
            mode,
        )
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Abandon everything a session owns: pending requests and cached
    /// decisions.
    pub fn drop_session(&self, session_id: &str) {
        self.permissions.drop_session(session_id);
    }

    pub fn permission_stats(&self) -> PermissionStats {
        self.permissions.stats()
    }

    pub fn plan_stats(&self) -> PlanStats {
        self.plans.stats()
    }

    /// Abort every in-flight operation and stop the background loops.
    /// Pending requests and plans resolve with a shutdown error; clients are
    /// closed normally.
    pub fn shutdown(&self) {
        info!("broker shutting down");
        self.shutdown.cancel();
        self.permissions.shutdown();
        self.plans.cancel_all();
        self.dispatcher.close_all();
    }
}
