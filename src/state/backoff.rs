use std::time::Duration;

use crate::protocol::{PROBE_BACKOFF_INITIAL, PROBE_BACKOFF_MAX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    /// Consecutive failures spent at one interval before it doubles.
    pub failures_per_step: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: PROBE_BACKOFF_INITIAL,
            max: PROBE_BACKOFF_MAX,
            failures_per_step: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeBackoff {
    config: BackoffConfig,
    failures: u32,
}

impl ProbeBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay before the next attempt; records one more unanswered attempt.
    pub fn next_delay(&mut self) -> Duration {
        let step = self.failures / self.config.failures_per_step.max(1);
        self.failures = self.failures.saturating_add(1);
        let factor = 1u32.checked_shl(step).unwrap_or(u32::MAX);
        self.config
            .initial
            .saturating_mul(factor)
            .min(self.config.max)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
