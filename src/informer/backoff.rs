//! Jittered exponential backoff for watch recovery.
use super::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial,
            config,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt. Doubles up to the configured max,
    /// plus up to `jitter` of the delay at random, never exceeding the max.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = self.current.saturating_mul(2).min(self.config.max);
        self.attempts = self.attempts.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.0..=jitter);
        base.saturating_add(base.mul_f64(factor)).min(self.config.max)
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.attempts = 0;
    }

    /// Failed attempts since the last reset
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}
