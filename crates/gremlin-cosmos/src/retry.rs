//! Delay between automatic retries.
//!
//! A server hint (`x-ms-retry-after-ms`) wins, capped by
//! [`RetryConfig::max_retry_after`]. Without one the delay grows
//! geometrically from `backoff_initial_delay` up to `backoff_max_delay`, and
//! up to `backoff_jitter` of it is shaved off at random.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Delay before retry number `attempt` (zero based).
pub(crate) fn retry_delay(config: &RetryConfig, attempt: u32, hint: Option<Duration>) -> Duration {
    if let Some(hint) = hint {
        return hint.min(config.max_retry_after);
    }

    let ceiling = exponential(config, attempt);
    if config.backoff_jitter == 0.0 {
        return ceiling;
    }
    let shave = config.backoff_jitter * rand::rng().random::<f64>();
    ceiling.mul_f64(1.0 - shave)
}

fn exponential(config: &RetryConfig, attempt: u32) -> Duration {
    let growth = config
        .backoff_factor
        .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
    Duration::try_from_secs_f64(config.backoff_initial_delay.as_secs_f64() * growth)
        .map_or(config.backoff_max_delay, |delay| {
            delay.min(config.backoff_max_delay)
        })
}
