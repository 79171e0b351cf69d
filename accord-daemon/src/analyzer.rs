//! Change analysis: how much a change matters, before anything validates it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use accord_core::{ChangeKind, ChangePayload, Impact, SemanticChange};

/// Result of analyzing one change payload. Published as `change_analyzed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeAnalysis {
    pub payload: ChangePayload,
    pub impact: Impact,
    /// Touches status, assignment, or task structure.
    pub critical: bool,
    /// Distinct fields named by the semantic changes, in first-seen order.
    pub fields: Vec<String>,
}

/// Collaborator that scores the impact of a raw change.
#[async_trait]
pub trait ChangeAnalyzer: Send + Sync {
    async fn analyze(&self, payload: &ChangePayload) -> ChangeAnalysis;
}

/// Derives impact from the semantic changes alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemanticAnalyzer;

#[async_trait]
impl ChangeAnalyzer for SemanticAnalyzer {
    async fn analyze(&self, payload: &ChangePayload) -> ChangeAnalysis {
        let mut fields: Vec<String> = Vec::new();
        for change in &payload.semantic_changes {
            if !fields.contains(&change.field) {
                fields.push(change.field.clone());
            }
        }
        let impact = if payload.semantic_changes.is_empty() {
            // Nothing is known about what moved.
            Impact::High
        } else {
            payload
                .semantic_changes
                .iter()
                .map(change_impact)
                .max()
                .unwrap_or(Impact::Low)
        };
        ChangeAnalysis {
            payload: payload.clone(),
            impact,
            critical: payload.touches_critical_fields(),
            fields,
        }
    }
}

fn change_impact(change: &SemanticChange) -> Impact {
    if change.is_critical() {
        return Impact::High;
    }
    match change.field.as_str() {
        "priority" | "type" | "title" => Impact::Medium,
        _ if change.kind != ChangeKind::Modified => Impact::Medium,
        _ => Impact::Low,
    }
}

/// Routing policy: validate medium/high impact changes and anything that
/// touches a critical field.
pub fn should_validate(analysis: &ChangeAnalysis) -> bool {
    analysis.impact >= Impact::Medium || analysis.critical
}
