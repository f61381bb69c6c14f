//! Bounded exponential backoff with jitter.

use super::connector::ConnectorError;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts; for tests and local sources.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)` plus
    /// up to half a base of jitter, capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(retry.saturating_sub(1).min(16));
        let backoff = self.base_delay.saturating_mul(factor);
        let jitter_ms = (self.base_delay.as_millis() / 2) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (backoff + jitter).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only errors for which [`ConnectorError::is_transient`] holds are
    /// retried; the last error is returned on exhaustion.
    pub fn run<T, F>(&self, label: &str, mut op: F) -> Result<T, ConnectorError>
    where
        F: FnMut(u32) -> Result<T, ConnectorError>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = self.delay_for(attempt);
                    debug!(%label, attempt, ?delay, error = %err, "transient failure, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(%label, attempts, error = %err, "retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}
