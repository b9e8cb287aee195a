use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    /// How long a permission request may sit unanswered before it resolves
    /// as a denial.
    pub TOOLGATE_PERMISSION_TIMEOUT_MS: Duration = Duration::from_millis(30_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Upper bound on concurrently pending permission requests.
    pub TOOLGATE_MAX_QUEUE_SIZE: usize = 100;

    /// Per-session cap on cached allow decisions.
    pub TOOLGATE_CACHE_MAX_PER_SESSION: usize = 1000;

    /// How long a cached allow decision stays valid.
    pub TOOLGATE_CACHE_TTL_MS: Duration = Duration::from_millis(3_600_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Interval between heartbeat sweeps over connected clients.
    pub TOOLGATE_HEARTBEAT_INTERVAL_MS: Duration = Duration::from_millis(30_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Per-client bound on messages queued while its channel is unwritable.
    pub TOOLGATE_MAX_QUEUED_PER_CLIENT: usize = 100;

    /// Interval between sweeps for requests that outlived their timer.
    pub TOOLGATE_CLEANUP_INTERVAL_MS: Duration = Duration::from_millis(60_000), |value| {
        value.parse().map(Duration::from_millis)
    };
}
