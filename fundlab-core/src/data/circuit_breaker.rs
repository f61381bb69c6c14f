//! Circuit breaker shared by connectors that talk to the same endpoint.
//!
//! When the regulator endpoint answers 403 (blocked) or keeps failing, the
//! breaker trips and every connector sharing it refuses requests until the
//! cooldown expires. Targets refused this way become unavailable for the run.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests are allowed.
    Closed,
    /// Requests are refused until the cooldown expires.
    Open { tripped_at: Instant },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    cooldown: Duration,
    consecutive_failures: AtomicU32,
    failure_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration, failure_threshold: u32) -> Self {
        Self {
            state: Mutex::new(BreakerState::Closed),
            cooldown,
            consecutive_failures: AtomicU32::new(0),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// 10-minute cooldown, trips after 5 consecutive exhausted fetches.
    pub fn for_regulator() -> Self {
        Self::new(Duration::from_secs(10 * 60), 5)
    }

    // A panicking holder cannot leave the state half-written, so a poisoned
    // lock is still usable.
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_allowed(&self) -> bool {
        let mut state = self.lock();
        match *state {
            BreakerState::Closed => true,
            BreakerState::Open { tripped_at } => {
                if tripped_at.elapsed() >= self.cooldown {
                    *state = BreakerState::Closed;
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Count a failure; trips the breaker once the threshold is reached.
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.failure_threshold {
            self.trip();
        }
    }

    /// Trip immediately (HTTP 403).
    pub fn trip(&self) {
        *self.lock() = BreakerState::Open {
            tripped_at: Instant::now(),
        };
    }

    pub fn remaining_cooldown(&self) -> Duration {
        match *self.lock() {
            BreakerState::Closed => Duration::ZERO,
            BreakerState::Open { tripped_at } => self.cooldown.saturating_sub(tripped_at.elapsed()),
        }
    }
}
