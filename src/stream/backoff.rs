//! Reconnect delay computation.

use std::time::Duration;

/// Delay before reconnect attempt `attempt` (1-based).
///
/// `base × 2^(attempt−1)`, capped at `cap`. Attempt 0 is treated as
/// attempt 1. Overflow saturates at the cap.
#[must_use]
pub fn reconnect_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let Some(factor) = 2u32.checked_pow(exponent.min(31)) else {
        return cap;
    };
    base.checked_mul(factor).map_or(cap, |delay| delay.min(cap))
}
