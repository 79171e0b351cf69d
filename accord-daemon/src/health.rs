//! Roll-up of the components' self-reported health.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use accord_core::{ComponentHealth, HealthStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Critical,
}

impl fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OverallHealth::Healthy => "healthy",
            OverallHealth::Degraded => "degraded",
            OverallHealth::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: OverallHealth,
    pub components: Vec<ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

impl SystemHealth {
    pub fn from_components(components: Vec<ComponentHealth>) -> Self {
        Self {
            status: overall(&components),
            components,
            checked_at: Utc::now(),
        }
    }
}

/// Healthy when every component is; critical when a majority report an
/// error; degraded otherwise.
pub fn overall(components: &[ComponentHealth]) -> OverallHealth {
    let errors = components
        .iter()
        .filter(|c| c.status == HealthStatus::Error)
        .count();
    if errors * 2 > components.len() {
        OverallHealth::Critical
    } else if components.iter().all(|c| c.status == HealthStatus::Healthy) {
        OverallHealth::Healthy
    } else {
        OverallHealth::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with(statuses: &[HealthStatus]) -> Vec<ComponentHealth> {
        statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let mut health = ComponentHealth::healthy(format!("c{i}"));
                if *status != HealthStatus::Healthy {
                    health.flag(*status, "test");
                }
                health
            })
            .collect()
    }

    #[test]
    fn all_healthy() {
        use HealthStatus::*;
        assert_eq!(overall(&with(&[Healthy, Healthy, Healthy, Healthy])), OverallHealth::Healthy);
    }

    #[test]
    fn minority_errors_degrade() {
        use HealthStatus::*;
        assert_eq!(overall(&with(&[Error, Healthy, Healthy, Healthy])), OverallHealth::Degraded);
        assert_eq!(overall(&with(&[Error, Error, Healthy, Healthy])), OverallHealth::Degraded);
        assert_eq!(overall(&with(&[Degraded, Healthy, Healthy, Healthy])), OverallHealth::Degraded);
    }

    #[test]
    fn majority_errors_are_critical() {
        use HealthStatus::*;
        assert_eq!(overall(&with(&[Error, Error, Error, Healthy])), OverallHealth::Critical);
    }
}
