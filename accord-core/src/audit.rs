//! Bounded, in-memory audit trail.
//!
//! Each component keeps its own log of significant actions (repairs,
//! resolutions, operations, health transitions). Entries beyond the capacity
//! evict the oldest.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub event: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct AuditLog {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, event: impl Into<String>, data: Value) {
        let entry = AuditEntry {
            event: event.into(),
            data,
            timestamp: Utc::now(),
        };
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Up to `limit` most recent entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evicts_oldest_past_capacity() {
        let log = AuditLog::new(2);
        log.record("a", json!(1));
        log.record("b", json!(2));
        log.record("c", json!(3));
        let events: Vec<_> = log.recent(10).into_iter().map(|e| e.event).collect();
        assert_eq!(events, vec!["b", "c"]);
    }

    #[test]
    fn recent_returns_tail() {
        let log = AuditLog::new(10);
        for i in 0..5 {
            log.record(format!("e{i}"), Value::Null);
        }
        let tail = log.recent(2);
        assert_eq!(tail[0].event, "e3");
        assert_eq!(tail[1].event, "e4");
        assert_eq!(log.len(), 5);
    }
}
