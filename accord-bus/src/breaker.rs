//! Per-handler circuit breaker.
//!
//! Closed: every delivery goes through. After `threshold` consecutive
//! failures the breaker opens and deliveries are skipped until the reset
//! window has elapsed. The first delivery after that is a half-open trial:
//! success closes the breaker, failure reopens it for another window.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    threshold: u32,
    reset_after: Duration,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    times_opened: u32,
}

/// Serializable view for stats and health output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub times_opened: u32,
    /// Milliseconds until an open breaker admits a trial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_in_ms: Option<u64>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_after: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            threshold: threshold.max(1),
            reset_after,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            times_opened: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a delivery may proceed at `now`. Moves an expired open
    /// breaker to half-open and claims its single trial.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if self.reset_deadline().is_some_and(|deadline| now >= deadline) {
                    self.state = BreakerState::HalfOpen;
                    self.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.trial_in_flight = false;
        let trip = match self.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => self.consecutive_failures >= self.threshold,
            BreakerState::Open => false,
        };
        if trip {
            self.state = BreakerState::Open;
            self.opened_at = Some(now);
            self.times_opened += 1;
        }
    }

    pub fn reset_deadline(&self) -> Option<Instant> {
        self.opened_at.map(|at| at + self.reset_after)
    }

    pub fn snapshot(&self, now: Instant) -> BreakerSnapshot {
        let reset_in_ms = match self.state {
            BreakerState::Open => self
                .reset_deadline()
                .map(|d| d.saturating_duration_since(now).as_millis() as u64),
            _ => None,
        };
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            times_opened: self.times_opened,
            reset_in_ms,
        }
    }
}
