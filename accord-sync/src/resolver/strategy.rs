//! Resolution strategies and their evaluation against one conflict.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use accord_core::config::{ResolverConfig, StrategyConfig};
use accord_core::state::AssignmentState;
use accord_core::types::{AgentId, SourceType};

use crate::conflict::{Conflict, ConflictType};
use crate::resolver::confidence::{confidence, ConfidenceFactors};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Newer write wins.
    TimeBased,
    /// The store that owns the field's category wins.
    AuthorityBased,
    /// The owning store wins if the value passes a domain rule.
    RuleBased,
    Manual,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::TimeBased => "time_based",
            StrategyKind::AuthorityBased => "authority_based",
            StrategyKind::RuleBased => "rule_based",
            StrategyKind::Manual => "manual",
        }
    }

    /// Automatic strategies that can act on `conflict_type`, in tie-break order.
    pub fn applicable_to(conflict_type: ConflictType) -> &'static [StrategyKind] {
        match conflict_type {
            ConflictType::AgentAssignmentMismatch => &[
                StrategyKind::TimeBased,
                StrategyKind::AuthorityBased,
                StrategyKind::RuleBased,
            ],
            ConflictType::StatusMismatch => &[StrategyKind::TimeBased, StrategyKind::AuthorityBased],
            ConflictType::ParseError => &[],
        }
    }

    fn config<'a>(&self, config: &'a ResolverConfig) -> Option<&'a StrategyConfig> {
        match self {
            StrategyKind::TimeBased => Some(&config.time_based),
            StrategyKind::AuthorityBased => Some(&config.authority_based),
            StrategyKind::RuleBased => Some(&config.rule_based),
            StrategyKind::Manual => None,
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One strategy scored against one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyEvaluation {
    pub strategy: StrategyKind,
    pub applicable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_source: Option<SourceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factors: Option<ConfidenceFactors>,
    pub confidence: f64,
    pub threshold: f64,
    pub reason: String,
}

impl StrategyEvaluation {
    fn not_applicable(strategy: StrategyKind, threshold: f64, reason: impl Into<String>) -> Self {
        Self {
            strategy,
            applicable: false,
            proposed_source: None,
            proposed_value: None,
            factors: None,
            confidence: 0.0,
            threshold,
            reason: reason.into(),
        }
    }

    pub fn clears_threshold(&self) -> bool {
        self.applicable && self.confidence >= self.threshold
    }
}

/// Inputs of the rule-based strategy's assignment check.
#[derive(Debug, Clone, Default)]
pub struct AssignmentRules {
    pub allowed_agents: Vec<String>,
    pub max_tasks_per_agent: usize,
    /// Current assignment state; `None` if it could not be read.
    pub assignments: Option<AssignmentState>,
}

impl AssignmentRules {
    /// `Err` names the rule the assignment violates.
    pub fn check(&self, conflict: &Conflict, agent: &str) -> Result<(), String> {
        if agent.trim().is_empty() {
            return Err("agent is empty".to_string());
        }
        if !self.allowed_agents.is_empty() && !self.allowed_agents.iter().any(|a| a == agent) {
            return Err(format!("agent '{agent}' is not in the roster"));
        }
        let Some(assignments) = &self.assignments else {
            return Err("assignment state unavailable".to_string());
        };
        let agent_id = AgentId::from(agent);
        let mut open = assignments.open_tasks_for(&agent_id);
        let already_holds = match (&conflict.spec_id, &conflict.task_id) {
            (Some(spec), Some(task)) => assignments
                .record(spec, task)
                .is_some_and(|r| r.agent == agent_id && r.status != accord_core::types::TaskStatus::Completed),
            _ => false,
        };
        if already_holds {
            open = open.saturating_sub(1);
        }
        if open >= self.max_tasks_per_agent {
            return Err(format!(
                "agent '{agent}' already holds {open} open task(s), limit {}",
                self.max_tasks_per_agent
            ));
        }
        Ok(())
    }
}

/// Score `strategy` for `conflict`.
pub fn evaluate(
    strategy: StrategyKind,
    conflict: &Conflict,
    integrity: f64,
    config: &ResolverConfig,
    rules: &AssignmentRules,
) -> StrategyEvaluation {
    let Some(strategy_config) = strategy.config(config) else {
        return StrategyEvaluation::not_applicable(strategy, 1.0, "manual strategy is never scored");
    };
    let threshold = strategy_config.auto_resolve_threshold;
    if !strategy_config.enabled {
        return StrategyEvaluation::not_applicable(strategy, threshold, "disabled");
    }
    if !StrategyKind::applicable_to(conflict.conflict_type).contains(&strategy) {
        return StrategyEvaluation::not_applicable(
            strategy,
            threshold,
            format!("does not apply to {}", conflict.conflict_type),
        );
    }

    let authority = conflict.category().authoritative_source();
    let proposed = match strategy {
        StrategyKind::TimeBased => {
            let Some(newer) = conflict.timestamps.newer_source else {
                return StrategyEvaluation::not_applicable(
                    strategy,
                    threshold,
                    "write times unknown or equal",
                );
            };
            newer
        }
        StrategyKind::AuthorityBased | StrategyKind::RuleBased | StrategyKind::Manual => authority,
    };
    let Some(value) = conflict.value_from(proposed).cloned() else {
        return StrategyEvaluation::not_applicable(
            strategy,
            threshold,
            format!("{proposed} value unknown"),
        );
    };

    if strategy == StrategyKind::RuleBased {
        let agent = value.as_str().unwrap_or_default();
        if let Err(violation) = rules.check(conflict, agent) {
            return StrategyEvaluation::not_applicable(strategy, threshold, violation);
        }
    }

    let factors = ConfidenceFactors::for_proposal(conflict, proposed, integrity, config);
    let score = confidence(strategy_config, &factors);
    let reason = match strategy {
        StrategyKind::TimeBased => format!("{proposed} holds the newer write"),
        StrategyKind::AuthorityBased => format!("{proposed} owns {} fields", conflict.field),
        _ => format!("{proposed} value passes assignment rules"),
    };
    StrategyEvaluation {
        strategy,
        applicable: true,
        proposed_source: Some(proposed),
        proposed_value: Some(value),
        factors: Some(factors),
        confidence: score,
        threshold,
        reason,
    }
}

/// Score every automatic strategy. Not-applicable ones are included with
/// confidence zero so the ticket context shows why they were passed over.
pub fn evaluate_all(
    conflict: &Conflict,
    integrity: f64,
    config: &ResolverConfig,
    rules: &AssignmentRules,
) -> Vec<StrategyEvaluation> {
    [
        StrategyKind::TimeBased,
        StrategyKind::AuthorityBased,
        StrategyKind::RuleBased,
    ]
    .into_iter()
    .map(|s| evaluate(s, conflict, integrity, config, rules))
    .collect()
}

/// Highest-confidence applicable evaluation; earlier strategies win ties.
pub fn best(evaluations: &[StrategyEvaluation]) -> Option<&StrategyEvaluation> {
    evaluations
        .iter()
        .filter(|e| e.applicable)
        .fold(None, |best: Option<&StrategyEvaluation>, e| match best {
            Some(b) if b.confidence >= e.confidence => Some(b),
            _ => Some(e),
        })
}
