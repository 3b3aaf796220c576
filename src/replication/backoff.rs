//! Bounded exponential backoff for pull retries

use std::time::Duration;

use super::HaSettings;

/// Exponential backoff (factor 2) with a delay cap and a retry budget
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max_delay: Duration,
    max_retries: u32,
    retries: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            initial,
            max_delay,
            max_retries,
            retries: 0,
        }
    }

    pub fn from_settings(settings: &HaSettings) -> Self {
        Self::new(settings.backoff_initial, settings.backoff_max, settings.pull_retry_max)
    }

    /// Delay before the next retry, or `None` once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(self.retries).unwrap_or(u32::MAX);
        self.retries += 1;
        Some(self.initial.saturating_mul(factor).min(self.max_delay))
    }

    /// Retries taken so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Restore the full budget
    pub fn reset(&mut self) {
        self.retries = 0;
    }
}
