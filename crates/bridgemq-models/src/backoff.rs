//! Retry delay formulas.
//!
//! The claim/retry scripts carry these same formulas server-side; this module
//! is the Rust mirror used for validation and tests. `attempt` is the number
//! of failures so far, starting at 1 for the first retry.

use crate::config::Backoff;

/// Pre-jitter delay for the given attempt.
///
/// - exponential: `min(base * 2^(attempt-1), max)`
/// - linear: `min(base * attempt, max)`
/// - fixed: `base`
pub fn backoff_delay_ms(backoff: Backoff, base_ms: i64, max_ms: i64, attempt: u32) -> i64 {
    let attempt = attempt.max(1);
    match backoff {
        Backoff::Exponential => {
            let factor = 1i64.checked_shl(attempt - 1).unwrap_or(i64::MAX);
            base_ms.saturating_mul(factor).min(max_ms)
        }
        Backoff::Linear => base_ms.saturating_mul(i64::from(attempt)).min(max_ms),
        Backoff::Fixed => base_ms,
    }
}

/// Apply uniform jitter to a delay.
///
/// `unit` is a uniform draw in [-1, 1]; the result is
/// `floor(delay * (1 + jitter_factor * unit))`, never below zero.
pub fn jittered_delay_ms(delay_ms: i64, jitter_factor: f64, unit: f64) -> i64 {
    let unit = unit.clamp(-1.0, 1.0);
    let factor = jitter_factor.clamp(0.0, 1.0);
    let jittered = (delay_ms as f64) * (1.0 + factor * unit);
    (jittered.floor() as i64).max(0)
}
