//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Delay before retry attempt `attempt` (1-based), jittered uniformly in
/// `[0, delay]` so synchronized callers spread out.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = config.multiplier.powi(attempt.saturating_sub(1) as i32);
    let raw = config.initial_delay.as_secs_f64() * exp;
    let capped = raw.min(config.max_delay.as_secs_f64());
    let jittered = rand::rng().random_range(0.0..=capped);
    Duration::from_secs_f64(jittered)
}
