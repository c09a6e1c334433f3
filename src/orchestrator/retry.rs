//! Retry backoff policy: exponential doubling from a configured base,
//! clamped to a cap.

use std::time::Duration;

/// Delay before retry attempt number `retry_count + 1`. Strictly
/// increasing per attempt until the cap is reached.
pub fn backoff_delay(base_ms: u64, cap_ms: u64, retry_count: u32) -> Duration {
    let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
    let delay = base_ms.checked_mul(factor).unwrap_or(u64::MAX);
    Duration::from_millis(delay.min(cap_ms))
}
