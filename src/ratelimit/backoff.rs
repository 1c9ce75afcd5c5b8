//! Retry delay policies.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lower bound of the jitter factor applied to a retry delay.
const JITTER_MIN: f64 = 0.9;
/// Upper bound (exclusive) of the jitter factor applied to a retry delay.
const JITTER_MAX: f64 = 1.1;

/// How the wait before a retry is derived from the base retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum Backoff {
    /// Wait the base delay before every retry.
    Fixed,
    /// Multiply the delay by `multiplier` after each retry, up to `max_delay_ms`.
    Exponential {
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default = "default_max_delay_ms")]
        max_delay_ms: u64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed
    }
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Backoff {
    /// Delay to wait before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32, base: Duration) -> Duration {
        match *self {
            Backoff::Fixed => base,
            Backoff::Exponential {
                multiplier,
                max_delay_ms,
            } => {
                let max_delay = Duration::from_millis(max_delay_ms);
                let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
                let scaled = base.as_secs_f64() * multiplier.powi(exponent);
                if !scaled.is_finite() || scaled >= max_delay.as_secs_f64() {
                    max_delay
                } else {
                    Duration::from_secs_f64(scaled)
                }
            }
        }
    }

    /// Upper bound on any delay this policy produces, if it has one.
    pub fn ceiling(&self) -> Option<Duration> {
        match *self {
            Backoff::Fixed => None,
            Backoff::Exponential { max_delay_ms, .. } => Some(Duration::from_millis(max_delay_ms)),
        }
    }

    /// Check that the policy is usable with the given base delay.
    pub fn validate(&self, base: Duration) -> std::result::Result<(), String> {
        match *self {
            Backoff::Fixed => Ok(()),
            Backoff::Exponential {
                multiplier,
                max_delay_ms,
            } => {
                if !multiplier.is_finite() || multiplier < 1.0 {
                    return Err(format!(
                        "backoff multiplier must be a finite number >= 1.0, got {multiplier}"
                    ));
                }
                if Duration::from_millis(max_delay_ms) < base {
                    return Err(format!(
                        "backoff max_delay_ms ({max_delay_ms}) is below retry_delay_ms ({})",
                        base.as_millis()
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Scale a delay by a random factor in `[0.9, 1.1)`, never exceeding `ceiling`.
pub fn apply_jitter(delay: Duration, ceiling: Option<Duration>) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(JITTER_MIN..JITTER_MAX);
    let jittered = delay.mul_f64(factor);
    match ceiling {
        Some(max) if jittered > max => max,
        _ => jittered,
    }
}
