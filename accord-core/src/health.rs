//! Self-reported component health, polled by the orchestrator.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Error,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    /// Human-readable reasons for a non-healthy status.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    #[serde(default)]
    pub details: Value,
}

impl ComponentHealth {
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            issues: Vec::new(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Record an issue, raising the status to at least `status`.
    pub fn flag(&mut self, status: HealthStatus, issue: impl Into<String>) {
        self.status = self.status.max(status);
        self.issues.push(issue.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_only_raises_status() {
        let mut health = ComponentHealth::healthy("bus");
        health.flag(HealthStatus::Error, "breaker open");
        health.flag(HealthStatus::Degraded, "dead letters queued");
        assert_eq!(health.status, HealthStatus::Error);
        assert_eq!(health.issues.len(), 2);
    }
}
