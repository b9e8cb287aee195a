use chrono::Utc;

/// Wire timestamps are epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
