//! Exponential backoff

use std::time::Duration;

/// Delay unit for retries
pub const BASE_RETRY_TIME: Duration = Duration::from_millis(1_000);
/// Largest exponent used by [`exp_backoff`]
pub const MAX_BACKOFF: u32 = 4;

/// `2^min(count, MAX_BACKOFF)` seconds
pub fn exp_backoff(count: u32) -> Duration {
    exp_backoff_capped(count, MAX_BACKOFF)
}

/// `2^min(count, max_exponent)` seconds
pub fn exp_backoff_capped(count: u32, max_exponent: u32) -> Duration {
    backoff_delay(BASE_RETRY_TIME, count, max_exponent)
}

pub fn backoff_delay(base: Duration, count: u32, max_exponent: u32) -> Duration {
    let exponent = count.min(max_exponent).min(31);
    base.saturating_mul(1u32 << exponent)
}
