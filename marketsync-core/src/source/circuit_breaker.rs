//! Circuit breaker for an overloaded or blocking data gateway.
//!
//! Batch runs hit the gateway from many workers at once. When it starts
//! refusing requests (HTTP 403, repeated 429/5xx) the breaker opens and every
//! worker fails fast for the cooldown instead of queueing more doomed calls.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
}

/// Shared by every worker of a client; all methods take `&self`.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<State>,
    cooldown: Duration,
    failure_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration, failure_threshold: u32) -> Self {
        Self {
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
            cooldown,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Five minute cooldown after five consecutive failures.
    pub fn for_gateway() -> Self {
        Self::new(Duration::from_secs(5 * 60), 5)
    }

    // A panicking worker must not disable the breaker for the rest of the run.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a request may be sent now. An expired cooldown closes the breaker.
    pub fn allows_request(&self) -> bool {
        let mut state = self.lock();
        match *state {
            State::Closed { .. } => true,
            State::Open { since } if since.elapsed() >= self.cooldown => {
                *state = State::Closed {
                    consecutive_failures: 0,
                };
                true
            }
            State::Open { .. } => false,
        }
    }

    pub fn record_success(&self) {
        *self.lock() = State::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        if let State::Closed {
            consecutive_failures,
        } = *state
        {
            let failures = consecutive_failures + 1;
            *state = if failures >= self.failure_threshold {
                State::Open {
                    since: Instant::now(),
                }
            } else {
                State::Closed {
                    consecutive_failures: failures,
                }
            };
        }
    }

    /// Open immediately, e.g. on an explicit ban.
    pub fn trip(&self) {
        *self.lock() = State::Open {
            since: Instant::now(),
        };
    }

    pub fn is_open(&self) -> bool {
        !self.allows_request()
    }

    pub fn remaining_cooldown(&self) -> Duration {
        match *self.lock() {
            State::Closed { .. } => Duration::ZERO,
            State::Open { since } => self.cooldown.saturating_sub(since.elapsed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold() {
        let cb = CircuitBreaker::new(Duration::from_secs(60), 3);
        cb.record_failure();
        cb.record_failure();
        assert!(cb.allows_request());
        cb.record_failure();
        assert!(!cb.allows_request());
        assert!(cb.remaining_cooldown() > Duration::ZERO);
    }

    #[test]
    fn success_clears_failure_streak() {
        let cb = CircuitBreaker::new(Duration::from_secs(60), 2);
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert!(cb.allows_request());
    }

    #[test]
    fn trip_then_cooldown_expires() {
        let cb = CircuitBreaker::new(Duration::from_millis(10), 3);
        cb.trip();
        assert!(cb.is_open());
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.allows_request());
        assert_eq!(cb.remaining_cooldown(), Duration::ZERO);
    }

    #[test]
    fn failures_while_open_do_not_extend_cooldown() {
        let cb = CircuitBreaker::new(Duration::from_millis(20), 1);
        cb.record_failure();
        let before = cb.remaining_cooldown();
        std::thread::sleep(Duration::from_millis(5));
        cb.record_failure();
        assert!(cb.remaining_cooldown() <= before);
    }
}
