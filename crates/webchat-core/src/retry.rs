use std::time::Duration;

use rand::Rng;

/// Exponential backoff policy with an optional jitter term.
///
/// The expected delay is monotone non-decreasing up to the cap; `reset`
/// returns the attempt counter to zero after a successful handshake.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    factor: f64,
    jitter: bool,
    max_jitter_ms: u64,
    attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            factor: 2.0,
            jitter: false,
            max_jitter_ms: 0,
            attempts: 0,
        }
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    /// Enable a uniform jitter term in `[0, min(delay, max_jitter)]`.
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.jitter = true;
        self.max_jitter_ms = max_jitter.as_millis() as u64;
        self
    }

    /// Jitter-free delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay_ms as f64 * self.factor.powi(attempt.min(64) as i32);
        let bounded = if scaled.is_finite() {
            (scaled as u64).min(self.max_delay_ms)
        } else {
            self.max_delay_ms
        };
        Duration::from_millis(bounded)
    }

    /// Delay for the current attempt (jitter applied), then advance.
    pub fn next(&mut self) -> Duration {
        let base = self.delay_for_attempt(self.attempts);
        self.attempts = self.attempts.saturating_add(1);

        if !self.jitter {
            return base;
        }

        let cap = (base.as_millis() as u64).min(self.max_jitter_ms);
        if cap == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=cap))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(30))
    }
}
