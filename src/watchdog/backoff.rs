//! Bad-start backoff.

use std::time::Duration;

/// Delay before relaunch attempt number `retries`: `2^retries` seconds,
/// capped at `max`.
pub fn backoff_delay(retries: u32, max: Duration) -> Duration {
    let secs = 1u64.checked_shl(retries).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(max)
}
