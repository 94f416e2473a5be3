//! Generic circuit breaker guarding Store calls made by the Matcher and the
//! ChatRouter. One instance per component, each configured with its own
//! thresholds.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

#[derive(Debug, Clone)]
enum State {
    Closed { failures: u32 },
    Open { tripped_at: Instant },
    HalfOpen { successes: u32 },
}

impl Default for State {
    fn default() -> Self {
        Self::Closed { failures: 0 }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_max_attempts: u32,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(
        name: &'static str,
        failure_threshold: u32,
        reset_timeout: Duration,
        half_open_max_attempts: u32,
    ) -> Self {
        Self {
            name,
            failure_threshold,
            reset_timeout,
            half_open_max_attempts,
            state: Mutex::new(State::default()),
        }
    }

    /// `failureThreshold=3, resetTimeout=60s, halfOpenMaxAttempts=2`
    pub fn for_matcher() -> Self {
        Self::new("matcher", 3, Duration::from_secs(60), 2)
    }

    /// `failureThreshold=5, resetTimeout=30s, halfOpenMaxAttempts=3`
    pub fn for_chat_router() -> Self {
        Self::new("chat_router", 5, Duration::from_secs(30), 3)
    }

    /// Whether a call should be attempted right now. Closed and HalfOpen
    /// both allow calls through; HalfOpen additionally caps how many
    /// concurrent probes are allowed before the breaker has an opinion,
    /// which is left to the caller (this only reports "not open").
    pub fn is_available(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return true;
        };

        match &*state {
            State::Closed { .. } => true,
            State::Open { tripped_at } => {
                if tripped_at.elapsed() >= self.reset_timeout {
                    info!(breaker = self.name, "circuit half-open, allowing probes");
                    *state = State::HalfOpen { successes: 0 };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { .. } => true,
        }
    }

    pub fn record_success(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        match &mut *state {
            State::Closed { failures } => *failures = 0,
            State::HalfOpen { successes } => {
                *successes += 1;
                if *successes >= self.half_open_max_attempts {
                    info!(breaker = self.name, "circuit closed after half-open recovery");
                    *state = State::Closed { failures: 0 };
                }
            }
            State::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let now = Instant::now();

        match &mut *state {
            State::Closed { failures } => {
                *failures += 1;
                if *failures >= self.failure_threshold {
                    warn!(
                        breaker = self.name,
                        failures = *failures,
                        "circuit tripped"
                    );
                    *state = State::Open { tripped_at: now };
                }
            }
            State::HalfOpen { .. } => {
                warn!(breaker = self.name, "half-open probe failed, re-tripping");
                *state = State::Open { tripped_at: now };
            }
            State::Open { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_breaker_is_available() {
        let cb = CircuitBreaker::new("test", 3, Duration::from_secs(1), 1);
        assert!(cb.is_available());
    }

    #[test]
    fn single_failure_does_not_trip() {
        let cb = CircuitBreaker::new("test", 3, Duration::from_secs(1), 1);
        cb.record_failure();
        assert!(cb.is_available());
    }

    #[test]
    fn threshold_failures_trips_circuit() {
        let cb = CircuitBreaker::new("test", 3, Duration::from_secs(60), 1);
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(!cb.is_available());
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = CircuitBreaker::new("test", 3, Duration::from_secs(60), 1);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert!(cb.is_available());
    }

    #[test]
    fn half_open_allows_probe_after_timeout() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_millis(10), 1);
        cb.record_failure();
        assert!(!cb.is_available());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.is_available());
    }

    #[test]
    fn half_open_needs_n_successes_to_close() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_millis(10), 2);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.is_available());
        cb.record_success();
        // still half-open, one more success required
        cb.record_failure();
        assert!(!cb.is_available());
    }

    #[test]
    fn half_open_failure_retrips() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_millis(10), 2);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.is_available());
        cb.record_failure();
        assert!(!cb.is_available());
    }
}
