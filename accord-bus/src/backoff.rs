//! Retry delay schedule.

use std::time::Duration;

/// Exponential backoff: `base × multiplier^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            multiplier: 2,
        }
    }

    /// Delay before retrying after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}
