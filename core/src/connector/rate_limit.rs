//! Per-agency token bucket.
//!
//! `rpm` tokens refill per minute up to a burst capacity. A poll cycle
//! reserves one token or, failing to get one within its interval, skips
//! the cycle and records it as rate limited.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = config.burst.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: config.rpm.max(1) as f64 / 60.0,
            state: Mutex::new(BucketState { tokens: capacity, last_refill: Instant::now() }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();
    }

    /// Take a token now if one is available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until the next token would be available.
    pub fn time_until_available(&self) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
        }
    }

    /// Wait up to `timeout` for a token.
    pub async fn acquire_within(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire() {
                return true;
            }
            let wait = self.time_until_available();
            if Instant::now() + wait > deadline {
                return false;
            }
            tokio::time::sleep(wait.max(Duration::from_millis(5))).await;
        }
    }
}
