//! Exponential backoff with optional jitter

use rand::Rng;
use std::time::Duration;

/// Doubling delay, capped at a maximum, with optional +/- jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    jitter_ratio: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `initial` and never exceeding `max`
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            jitter_ratio: 0.0,
            attempt: 0,
        }
    }

    /// Apply a random +/- `ratio` fraction to every delay (clamped to `0.0..=1.0`)
    #[must_use]
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Delay for a given attempt without jitter
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Delay to wait before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter_ratio <= 0.0 {
            return base;
        }

        let ratio = self.jitter_ratio;
        let factor = 1.0 + rand::thread_rng().gen_range(-ratio..=ratio);
        base.mul_f64(factor).min(self.max)
    }

    /// Forget previous failures
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Upper bound on any delay
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max
    }
}
