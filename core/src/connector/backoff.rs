//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// Delay schedule `min(initial * 2^attempt, max)`, jittered +/-25%.
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_ms.max(1)),
            max: Duration::from_millis(config.max_ms.max(1)),
            attempt: 0,
        }
    }

    /// Next delay in the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .initial
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        jitter(exp)
    }

    /// Undelayed base schedule, for tests and logging.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

fn jitter(base: Duration) -> Duration {
    let millis = base.as_millis() as i64;
    if millis == 0 {
        return base;
    }
    let spread = (millis / 4).max(1);
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis((millis + offset).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_doubles_and_caps() {
        let config = RetryConfig { max: 5, initial_ms: 100, max_ms: 400 };
        let mut backoff = Backoff::new(&config);
        // Jitter is +/-25%, so check bands rather than exact values.
        let d1 = backoff.next_delay().as_millis();
        assert!((75..=125).contains(&d1), "d1={d1}");
        let d2 = backoff.next_delay().as_millis();
        assert!((150..=250).contains(&d2), "d2={d2}");
        let d3 = backoff.next_delay().as_millis();
        assert!((300..=500).contains(&d3), "d3={d3}");
        // capped at max_ms regardless of attempt
        let d4 = backoff.next_delay().as_millis();
        assert!((300..=500).contains(&d4), "d4={d4}");
    }

    #[test]
    fn reset_restarts_schedule() {
        let config = RetryConfig { max: 5, initial_ms: 100, max_ms: 400 };
        let mut backoff = Backoff::new(&config);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        let d = backoff.next_delay().as_millis();
        assert!((75..=125).contains(&d), "d={d}");
    }
}
