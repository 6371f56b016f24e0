//! Retry policy for failed device attempts.
//!
//! Pure functions of the retry count and the deployment's rollout config,
//! so the same inputs always produce the same decision.

use std::time::Duration;

use fleetgrid_state::RolloutConfig;

/// Whether a device that has already been retried `retry_count` times may
/// be retried again.
pub fn can_retry(retry_count: u32, config: &RolloutConfig) -> bool {
    retry_count < config.max_retries
}

/// Delay before retry number `retry_count + 1`.
///
/// `base × multiplier^retry_count`, capped at `max_secs`. A multiplier
/// below 1 is treated as 1 so the delay never shrinks.
pub fn backoff_delay(retry_count: u32, config: &RolloutConfig) -> Duration {
    let backoff = &config.retry_backoff;
    let factor = u64::from(backoff.multiplier.max(1)).saturating_pow(retry_count);
    let secs = backoff.base_secs.saturating_mul(factor).min(backoff.max_secs);
    Duration::from_secs(secs)
}
