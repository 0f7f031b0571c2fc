//! Wall-clock millisecond helpers.
//!
//! Expiration deadlines are absolute epoch milliseconds because they are
//! persisted (RDB) and shipped to replicas; a process-local monotonic
//! clock would not survive a restart. Deadlines below zero mean
//! "no expiration".

use std::time::{SystemTime, UNIX_EPOCH};

/// Sentinel deadline meaning "no expiration".
pub const NO_EXPIRY: i64 = -1;

/// Current wall-clock time in milliseconds since the Unix epoch.
#[inline]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Returns true if the given deadline has passed.
#[inline]
pub fn is_expired(expire_at_ms: i64, now: i64) -> bool {
    expire_at_ms >= 0 && now >= expire_at_ms
}
