//! Exponential backoff with full jitter.
//!
//! Used at every call site that talks to the stream service: shard
//! discovery, iterator creation and record fetches.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::RetryConfig;

/// Tracks consecutive failures of one operation and computes the delay
/// before the next attempt.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    max_attempts: u32,
    jitter: bool,
    attempt: u32,
    current: Duration,
    rng: StdRng,
}

impl Backoff {
    /// Create a backoff tracker for `config`.
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self::with_rng(config, StdRng::from_rng(&mut rand::rng()))
    }

    /// Create a backoff tracker with a deterministic jitter source.
    #[must_use]
    pub fn with_seed(config: &RetryConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &RetryConfig, rng: StdRng) -> Self {
        Self {
            initial: config.initial_backoff,
            max: config.max_backoff,
            multiplier: config.multiplier,
            max_attempts: config.max_attempts,
            jitter: config.jitter,
            attempt: 0,
            current: config.initial_backoff,
            rng,
        }
    }

    /// Failures recorded since the last success.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns `true` once the attempt budget is spent.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Upper bound of any delay this backoff returns.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max
    }

    /// Clears the failure streak after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current = self.initial;
    }

    /// Records a failure and returns the delay before retrying, or `None`
    /// when the attempt budget is spent.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        self.attempt += 1;

        let ceiling = self.current.min(self.max);
        let delay = if self.jitter {
            let ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
            Duration::from_millis(self.rng.random_range(0..=ms))
        } else {
            ceiling
        };

        let next_ms = (self.current.as_millis() as f64 * self.multiplier) as u64;
        self.current = Duration::from_millis(next_ms).min(self.max);

        Some(delay)
    }
}
