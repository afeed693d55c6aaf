//! Retry schedule for failed deliveries
//!
//! `delay = base × 2^min(attempts, cap) + jitter`, where the jitter is a
//! fraction of the delay derived from the record's idempotency key. The
//! fraction is the same on every attempt, so one record's delays never shrink
//! while different records still spread out.

use crate::config::SyncConfig;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    max_exponent: u32,
    jitter_ratio: f64,
    max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_exponent: u32, jitter_ratio: f64, max_attempts: u32) -> Self {
        Self {
            base,
            max_exponent,
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.base_backoff,
            config.max_backoff_exponent,
            config.jitter_ratio,
            config.max_attempts,
        )
    }

    /// Delay before the next attempt of a record that has failed `attempts` times.
    pub fn delay(&self, attempts: u32, key: &str) -> Duration {
        let exponent = attempts.min(self.max_exponent);
        let delay = self.base.saturating_mul(2u32.saturating_pow(exponent));
        let jitter = delay.mul_f64(self.jitter_ratio * jitter_fraction(key));
        delay.saturating_add(jitter)
    }

    /// Absolute time of the next attempt.
    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempts: u32, key: &str) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempts, key))
            .unwrap_or_else(|_| chrono::Duration::days(1));
        now + delay
    }

    /// Whether a record that has failed `attempts` times must be dead-lettered.
    pub fn should_dead_letter(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Stable fraction in `[0, 1)` for a key.
fn jitter_fraction(key: &str) -> f64 {
    let digest = Sha256::digest(key.as_bytes());
    let prefix = digest
        .iter()
        .take(8)
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    // 53 bits fit exactly in an f64 mantissa.
    let bits = prefix >> 11;
    bits as f64 / (1u64 << 53) as f64
}
