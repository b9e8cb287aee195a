use std::time::Duration;

use crate::flags::TOOLGATE_CACHE_MAX_PER_SESSION;
use crate::flags::TOOLGATE_CACHE_TTL_MS;
use crate::flags::TOOLGATE_CLEANUP_INTERVAL_MS;
use crate::flags::TOOLGATE_HEARTBEAT_INTERVAL_MS;
use crate::flags::TOOLGATE_MAX_QUEUED_PER_CLIENT;
use crate::flags::TOOLGATE_MAX_QUEUE_SIZE;
use crate::flags::TOOLGATE_PERMISSION_TIMEOUT_MS;

/// Tunables for the broker.
///
/// Defaults come from the environment (see `flags.rs`); embedding runtimes
/// can override individual fields before handing the config to
/// [`crate::Broker::spawn`]. The plan-approval timeout reuses
/// `permission_timeout`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub permission_timeout: Duration,
    pub max_queue_size: usize,
    pub cache_max_per_session: usize,
    pub cache_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub max_queued_per_client: usize,
    pub cleanup_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            permission_timeout: *TOOLGATE_PERMISSION_TIMEOUT_MS,
            max_queue_size: *TOOLGATE_MAX_QUEUE_SIZE,
            cache_max_per_session: *TOOLGATE_CACHE_MAX_PER_SESSION,
            cache_ttl: *TOOLGATE_CACHE_TTL_MS,
            heartbeat_interval: *TOOLGATE_HEARTBEAT_INTERVAL_MS,
            max_queued_per_client: *TOOLGATE_MAX_QUEUED_PER_CLIENT,
            cleanup_interval: *TOOLGATE_CLEANUP_INTERVAL_MS,
        }
    }
}
