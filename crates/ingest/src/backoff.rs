//! Reconnect Backoff Policy

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First retry delay (ms)
    pub initial_ms: u64,
    /// Upper bound for any delay (ms)
    pub max_ms: u64,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Relative jitter, 0.2 = ±20%
    pub jitter: f64,
    /// Give up after this many consecutive failures (unbounded when unset)
    pub max_retries: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 5_000,
            max_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_retries: None,
        }
    }
}

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    max_retries: Option<u32>,
}

impl BackoffPolicy {
    /// Build from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        let initial = Duration::from_millis(config.initial_ms);
        Self {
            initial,
            max: Duration::from_millis(config.max_ms).max(initial),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
            max_retries: config.max_retries,
        }
    }

    /// Constant delay, unbounded attempts
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            multiplier: 1.0,
            jitter: 0.0,
            max_retries: None,
        }
    }

    /// Delay before retry `attempt` (1-based) without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max.as_millis() as f64) as u64)
    }

    /// Delay before retry `attempt` with jitter applied
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Delay before retry `attempt` using the given random source
    pub fn delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter == 0.0 {
            return base;
        }
        let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        base.mul_f64(factor).min(self.max)
    }

    /// Whether `attempt` failures exhaust the retry budget
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_retries.map_or(false, |max| attempt > max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}
