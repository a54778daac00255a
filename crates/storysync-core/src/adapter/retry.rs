//! Retry with exponential backoff for transient tracker failures.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

use super::AdapterError;

/// Bounded exponential backoff.
///
/// Attempt `n` (1-based) that fails transiently waits
/// `min(base * multiplier^(n-1), max)` before attempt `n + 1`, scaled by a
/// random factor in `[0.5, 1.0]` when `jitter` is set. A server-provided
/// `retry_after` replaces the computed delay (still capped at `max_delay`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// One attempt, no retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Retries without sleeping. Useful for tests and simulations.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32, err: &AdapterError) -> Duration {
        if let Some(wait) = err.retry_after() {
            return wait.min(self.max_delay);
        }
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let scaled = if self.jitter && capped > 0.0 {
            capped * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped
        };
        Duration::try_from_secs_f64(scaled).unwrap_or(self.max_delay)
    }
}

/// Run `f` until it succeeds, fails permanently, or runs out of attempts.
///
/// Only [`AdapterError::is_transient`] failures are retried. The last error
/// is returned once attempts are exhausted.
///
/// # Errors
///
/// The first non-transient error, or the last transient one.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    op: &str,
    mut f: impl FnMut() -> Result<T, AdapterError>,
) -> Result<T, AdapterError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt, &err);
                tracing::debug!(op, attempt, ?delay, %err, "transient failure, retrying");
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                attempt += 1;
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::warn!(op, attempt, %err, "retries exhausted");
                }
                return Err(err);
            }
        }
    }
}
