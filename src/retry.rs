//! Redelivery backoff computation.
//!
//! Pure arithmetic over a handler's retry settings: given the base interval
//! and the attempt number, produce the scheduled-visibility delay for the
//! next redelivery. Stateless; the attempt counter itself travels on the
//! message's property bag.

use std::time::Duration;

/// Computes the delay before attempt `attempt` of a redelivered message.
///
/// With `doubling` disabled the base interval is returned unchanged. With it
/// enabled the interval doubles per attempt beyond the first, so attempt 1
/// waits `base`, attempt 2 waits `2 * base`, attempt 3 waits `4 * base` and
/// so on. The result is clamped to `cap` when one is configured.
///
/// Attempt numbers start at 1. The arithmetic saturates instead of
/// overflowing for unreasonably large attempt numbers.
pub fn next_delay(base: Duration, attempt: u32, doubling: bool, cap: Option<Duration>) -> Duration {
    let delay = if doubling {
        let factor = exponent_for(attempt);
        base.checked_mul(factor).unwrap_or(Duration::MAX)
    } else {
        base
    };

    match cap {
        Some(cap) if delay > cap => cap,
        _ => delay,
    }
}

fn exponent_for(attempt: u32) -> u32 {
    2u32.saturating_pow(attempt.saturating_sub(1).min(31))
}
