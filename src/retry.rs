//! Exponential backoff with jitter, shared by the fetcher and the
//! retrying classifier.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_ms: u64, max_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms.max(base_ms)),
            jitter: true,
        }
    }

    /// Tests use this to keep retries instantaneous.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Backoff before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at `max_delay`, plus up to `base/2` of uniform jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(20);
        let base_ms = self.base_delay.as_millis() as u64;
        let raw = base_ms
            .checked_shl(exp)
            .unwrap_or(u64::MAX)
            .min(self.max_delay.as_millis() as u64);
        let jitter = if self.jitter && base_ms > 1 {
            rand::rng().random_range(0..=base_ms / 2)
        } else {
            0
        };
        Duration::from_millis(raw.saturating_add(jitter))
    }
}
