//! Jitter for retry backoff

use rand::Rng;

/// Random jitter between 0 and `max_jitter_ms` (inclusive)
///
/// ```
/// use stream_relay::utils::jitter::generate_jitter_ms;
///
/// let jitter = generate_jitter_ms(100);
/// assert!(jitter <= 100);
/// ```
pub fn generate_jitter_ms(max_jitter_ms: u64) -> u64 {
    if max_jitter_ms == 0 {
        return 0;
    }
    rand::rng().random_range(0..=max_jitter_ms)
}

/// Backoff for the given retry attempt (1-based): a linear base of
/// `attempt * step_ms` plus up to `step_ms` of jitter
pub fn backoff_ms(attempt: u32, step_ms: u64) -> u64 {
    u64::from(attempt).saturating_mul(step_ms) + generate_jitter_ms(step_ms)
}
