//! Scheduling constants for autosave and sync, and the retry delay.

use std::time::Duration;

/// Quiet period after the last mutation before a snapshot is written.
pub const AUTOSAVE_DEBOUNCE_MS: u64 = 500;

/// Periodic sync cadence in seconds.
pub const SYNC_INTERVAL_SECS: u64 = 120;

/// Maximum jitter (seconds) added to periodic cycle intervals.
pub const SYNC_INTERVAL_JITTER_SECS: u64 = 5;

/// Default timeout for a single remote request.
pub const SYNC_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound on pending rows sent in one table push.
pub const SYNC_PUSH_BATCH_LIMIT: i64 = 500;

/// First retry delay after a failed cycle; doubles with each further failure.
pub const SYNC_RETRY_BASE_SECS: u64 = 5;

/// Delay before the next periodic cycle.
///
/// With no failures this is `interval`. After `n` consecutive failed cycles
/// it is `SYNC_RETRY_BASE_SECS * 2^n`, never longer than `interval`.
pub fn next_cycle_delay(consecutive_failures: i32, interval: Duration) -> Duration {
    let failures = match u32::try_from(consecutive_failures) {
        Ok(0) | Err(_) => return interval,
        Ok(failures) => failures,
    };
    2u64.checked_pow(failures)
        .and_then(|factor| factor.checked_mul(SYNC_RETRY_BASE_SECS))
        .map(Duration::from_secs)
        .map_or(interval, |retry| retry.min(interval))
}
