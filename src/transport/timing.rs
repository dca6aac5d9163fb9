//! Reconnect backoff.

use std::time::Duration;

use crate::config::{RetryConfig, TimingConfig};

/// Exponential reconnect backoff.
///
/// `delay(attempt) = min(base * 2^(attempt - 1), max)` for attempts
/// `1..=max_attempts`; any later attempt means giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
}

impl ReconnectBackoff {
    /// Create a backoff policy.
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
        }
    }

    /// Build from the link configuration.
    pub fn from_config(timing: &TimingConfig, retry: &RetryConfig) -> Self {
        Self::new(
            timing.reconnect_base(),
            timing.reconnect_max(),
            retry.max_reconnect_attempts,
        )
    }

    /// Delay before reconnect `attempt` (1-based), or `None` once attempts
    /// are exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.max))
    }

    /// Attempts allowed before giving up.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::from_config(&TimingConfig::default(), &RetryConfig::default())
    }
}
