//! Exponential backoff schedule for reconnect attempts.

use std::time::Duration;

/// Delay before the given attempt (1-based): `base * 2^(attempt-1)`, capped.
#[must_use]
pub(crate) fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let factor = 1u32 << exponent;
    base.saturating_mul(factor).min(max)
}
