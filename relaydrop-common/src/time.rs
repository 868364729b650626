//! Wall-clock helpers
//!
//! Control messages carry epoch-millisecond timestamps. Session timing on the
//! relay uses monotonic `tokio::time::Instant` instead, so only wire-facing
//! code goes through this module.

use chrono::Utc;

/// Milliseconds per second
pub const MILLIS_PER_SECOND: i64 = 1000;

/// Seconds per minute
pub const SECONDS_PER_MINUTE: u64 = 60;

/// Current time as milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
