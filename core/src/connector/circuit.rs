//! Connector circuit breaker.
//!
//! Rolling failure rate over the last `window` requests. Above the
//! threshold the breaker opens for a cooldown, then lets one probe through
//! (half-open). A successful probe closes it; a failed probe re-opens with
//! the cooldown doubled, up to a cap.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Rolling window size in requests.
    pub window: usize,
    /// Minimum samples before the rate is meaningful.
    pub min_samples: usize,
    /// Failure rate that opens the circuit.
    pub failure_threshold: f64,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window: 20,
            min_samples: 5,
            failure_threshold: 0.5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(480),
        }
    }
}

struct Inner {
    state: CircuitState,
    /// true = failure
    outcomes: VecDeque<bool>,
    opened_at: Option<Instant>,
    current_cooldown: Duration,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let cooldown = config.cooldown;
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                outcomes: VecDeque::new(),
                opened_at: None,
                current_cooldown: cooldown,
            }),
        }
    }

    /// May a request go out right now? An `Open` breaker whose cooldown
    /// elapsed transitions to `HalfOpen` and admits exactly one probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= inner.current_cooldown {
                    inner.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.outcomes.clear();
                inner.opened_at = None;
                inner.current_cooldown = self.config.cooldown;
            }
            _ => self.push_outcome(&mut inner, false),
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                // Failed probe: back to open, cooldown doubled up to the cap.
                inner.current_cooldown =
                    (inner.current_cooldown * 2).min(self.config.max_cooldown);
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            _ => {
                self.push_outcome(&mut inner, true);
                let rate = Self::rate(&inner.outcomes);
                if inner.outcomes.len() >= self.config.min_samples
                    && rate > self.config.failure_threshold
                {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
        }
    }

    fn push_outcome(&self, inner: &mut Inner, failed: bool) {
        inner.outcomes.push_back(failed);
        while inner.outcomes.len() > self.config.window {
            inner.outcomes.pop_front();
        }
    }

    fn rate(outcomes: &VecDeque<bool>) -> f64 {
        if outcomes.is_empty() {
            return 0.0;
        }
        outcomes.iter().filter(|f| **f).count() as f64 / outcomes.len() as f64
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Failure rate over the rolling window.
    pub fn error_rate(&self) -> f64 {
        Self::rate(&self.inner.lock().outcomes)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            window: 10,
            min_samples: 4,
            failure_threshold: 0.5,
            cooldown: Duration::from_millis(20),
            max_cooldown: Duration::from_millis(80),
        })
    }

    #[test]
    fn opens_after_failure_rate_exceeds_threshold() {
        let breaker = fast_breaker();
        for _ in 0..4 {
            assert!(breaker.allow());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn half_open_probe_closes_on_success() {
        let breaker = fast_breaker();
        for _ in 0..4 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.allow()); // the single probe
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.allow()); // no second request while probing
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn failed_probe_doubles_cooldown_up_to_cap() {
        let breaker = fast_breaker();
        for _ in 0..4 {
            breaker.record_failure();
        }
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(85));
            assert!(breaker.allow());
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Open);
        }
        // Cooldown never exceeds the cap, so a probe is allowed after it.
        std::thread::sleep(Duration::from_millis(85));
        assert!(breaker.allow());
    }

    #[test]
    fn successes_keep_it_closed() {
        let breaker = fast_breaker();
        for _ in 0..20 {
            breaker.record_success();
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.error_rate() < 0.5);
    }
}
