//! Retry and reconnect timing
//!
//! - `RetryPolicy`: response timeout and exponential backoff per message
//! - `ReconnectPolicy`: randomized exponential wait between connection attempts

use std::time::Duration;

use rand::Rng;

use crate::config::{QueueConfig, ReconnectConfig};

/// Per-message retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub message_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    /// Wait before the next transmission after `attempts` unanswered ones:
    /// `min(base * 2^(attempts-1), cap)`
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            message_timeout: config.message_timeout,
            max_attempts: config.max_attempts.max(1),
            backoff_base: config.backoff_base,
            backoff_cap: config.backoff_cap,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

/// Connection retry timing. The attempt counter resets on every successful
/// connection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// `min(wait_minimum * 2^attempt + random(0..random_range), max_delay)`,
    /// the exponent stops growing after `repeat_times` attempts
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(self.config.repeat_times).min(31);
        self.attempt = self.attempt.saturating_add(1);

        let base = self
            .config
            .wait_minimum
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.config.max_delay);

        let range_ms = self.config.random_range.as_millis() as u64;
        let jitter = if range_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..range_ms))
        };

        (base + jitter).min(self.config.max_delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
