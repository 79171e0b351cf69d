//! Events and their transport metadata.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known event types exchanged between accord components.
pub mod topics {
    pub const CHANGE_ANALYZED: &str = "change_analyzed";
    pub const VALIDATION_COMPLETE: &str = "validation_complete";
    pub const SYNC_COMPLETED: &str = "sync_completed";
    pub const SYNC_FAILED: &str = "sync_failed";
    pub const CONFLICT_DETECTED: &str = "conflict_detected";
    pub const CONFLICT_RESOLVED: &str = "conflict_resolved";
    pub const MANUAL_INTERVENTION_REQUIRED: &str = "manual_intervention_required";
    pub const REPAIR_PERFORMED: &str = "repair_performed";
    pub const HEALTH_CHANGED: &str = "health_changed";
    pub const SYSTEM_ERROR: &str = "system_error";
}

/// Dispatch priority, `0..=10`. Higher drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const LOW: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(5);
    pub const HIGH: Priority = Priority(8);
    pub const MAX: Priority = Priority(10);

    /// Clamps to [`Priority::MAX`].
    pub fn new(value: u8) -> Self {
        Priority(value.min(Self::MAX.0))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub id: String,
    pub priority: Priority,
    /// Wall-clock publish time. Expiry uses the bus's monotonic clock.
    pub timestamp: DateTime<Utc>,
    pub source: String,
    /// Maximum queue age before the event is dead-lettered unhandled.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub retries: u32,
    /// 1-based delivery attempt.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Id of the dead-lettered event this one replays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<String>,
}

/// Unit of bus transport. The payload is immutable; only `attempt` moves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub metadata: EventMetadata,
}

impl EnhancedEvent {
    pub fn is_replay(&self) -> bool {
        self.metadata.replay_of.is_some()
    }
}

/// Per-publish overrides; unset fields fall back to the bus defaults.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub priority: Option<Priority>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub source: Option<String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_clamps_to_max() {
        assert_eq!(Priority::new(42), Priority::MAX);
        assert!(Priority::HIGH > Priority::NORMAL);
    }

    #[test]
    fn metadata_serializes_timeout_as_millis() {
        let meta = EventMetadata {
            id: "e1".into(),
            priority: Priority::NORMAL,
            timestamp: Utc::now(),
            source: "test".into(),
            timeout: Duration::from_secs(2),
            retries: 1,
            attempt: 1,
            max_attempts: 2,
            replay_of: None,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["timeout"], 2000);
        assert!(json.get("replay_of").is_none());
    }
}
