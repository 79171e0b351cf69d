//! Manual intervention tickets and their priority queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use similar::TextDiff;

use accord_core::types::{Severity, SourceType};

use crate::conflict::{Conflict, ConflictTimestamps, ConflictType};
use crate::resolver::strategy::{StrategyEvaluation, StrategyKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Processing,
    /// The last decision could not be applied; the ticket may be retried.
    Failed,
}

/// Everything a human needs to decide without re-deriving the disagreement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketContext {
    pub evaluations: Vec<StrategyEvaluation>,
    pub document_value: Value,
    pub structured_value: Value,
    /// Unified diff, document (a) against structured (b).
    pub diff: String,
    pub timestamps: ConflictTimestamps,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualInterventionTicket {
    pub id: String,
    pub conflict_id: String,
    pub conflict: Conflict,
    /// Best automatic strategy seen, or `manual` if none applied.
    pub recommended_strategy: StrategyKind,
    /// Always zero: the ticket exists because no strategy was trusted.
    pub confidence: f64,
    pub status: TicketStatus,
    pub priority: u32,
    pub context: TicketContext,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ManualInterventionTicket {
    pub fn new(
        conflict: Conflict,
        evaluations: Vec<StrategyEvaluation>,
        reason: impl Into<String>,
        priority: u32,
    ) -> Self {
        let recommended_strategy = crate::resolver::strategy::best(&evaluations)
            .map(|e| e.strategy)
            .unwrap_or(StrategyKind::Manual);
        let document_value = conflict_value(&conflict, SourceType::Document);
        let structured_value = conflict_value(&conflict, SourceType::Structured);
        let diff = value_diff(&document_value, &structured_value);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conflict_id: conflict.id.clone(),
            recommended_strategy,
            confidence: 0.0,
            status: TicketStatus::Pending,
            priority,
            context: TicketContext {
                evaluations,
                document_value,
                structured_value,
                diff,
                timestamps: conflict.timestamps.clone(),
                reason: reason.into(),
            },
            conflict,
            created_at: Utc::now(),
            error: None,
        }
    }
}

/// The full per-store data when no single value is known (parse errors).
fn conflict_value(conflict: &Conflict, source: SourceType) -> Value {
    match conflict.value_from(source) {
        Some(value) => value.clone(),
        None => match source {
            SourceType::Document => conflict.document_data.clone(),
            SourceType::Structured => conflict.structured_data.clone(),
        },
    }
}

/// Base 1; +3 high severity; +5 suspected corruption; +2 assignment conflict.
pub fn ticket_priority(conflict: &Conflict, integrity: f64, corruption_integrity: f64) -> u32 {
    let mut priority = 1;
    if conflict.severity == Severity::High {
        priority += 3;
    }
    if conflict.conflict_type == ConflictType::ParseError || integrity < corruption_integrity {
        priority += 5;
    }
    if conflict.conflict_type.is_assignment() {
        priority += 2;
    }
    priority
}

pub fn value_diff(document: &Value, structured: &Value) -> String {
    let render = |v: &Value| {
        let mut text = serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string());
        text.push('\n');
        text
    };
    let (old, new) = (render(document), render(structured));
    TextDiff::from_lines(&old, &new)
        .unified_diff()
        .header("document", "structured")
        .context_radius(3)
        .to_string()
}

/// Pending tickets ordered by priority (highest first), then age.
#[derive(Debug, Default)]
pub(crate) struct TicketQueue {
    tickets: Vec<ManualInterventionTicket>,
}

impl TicketQueue {
    pub(crate) fn insert(&mut self, ticket: ManualInterventionTicket) {
        let at = self
            .tickets
            .iter()
            .position(|t| t.priority < ticket.priority)
            .unwrap_or(self.tickets.len());
        self.tickets.insert(at, ticket);
    }

    /// Open ticket for the same disagreement, if any.
    pub(crate) fn find_duplicate(&self, conflict: &Conflict) -> Option<&ManualInterventionTicket> {
        let fingerprint = conflict.fingerprint();
        self.tickets
            .iter()
            .find(|t| t.conflict.fingerprint() == fingerprint)
    }

    pub(crate) fn get(&self, id: &str) -> Option<&ManualInterventionTicket> {
        self.tickets.iter().find(|t| t.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut ManualInterventionTicket> {
        self.tickets.iter_mut().find(|t| t.id == id)
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<ManualInterventionTicket> {
        let at = self.tickets.iter().position(|t| t.id == id)?;
        Some(self.tickets.remove(at))
    }

    pub(crate) fn all(&self) -> Vec<ManualInterventionTicket> {
        self.tickets.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.tickets.len()
    }

    pub(crate) fn count(&self, status: TicketStatus) -> usize {
        self.tickets.iter().filter(|t| t.status == status).count()
    }
}
