//! Confidence scoring.
//!
//! `confidence = base + w_time * time + w_authority * authority + w_integrity * integrity`,
//! clamped to `[0, 1]`. Each factor score is itself in `[0, 1]`.

use serde::{Deserialize, Serialize};

use accord_core::config::{ResolverConfig, StrategyConfig};
use accord_core::types::SourceType;

use crate::conflict::Conflict;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceFactors {
    pub time: f64,
    pub authority: f64,
    pub integrity: f64,
}

impl ConfidenceFactors {
    /// Factor scores for resolving `conflict` with the value held by `proposed`.
    pub fn for_proposal(
        conflict: &Conflict,
        proposed: SourceType,
        integrity: f64,
        config: &ResolverConfig,
    ) -> Self {
        let time = match conflict.timestamps.newer_source {
            Some(newer) if newer == proposed => {
                time_score(conflict.timestamps.gap(), config.time_saturation_secs)
            }
            _ => 0.0,
        };
        let authority = if conflict.category().authoritative_source() == proposed {
            1.0
        } else {
            config.authority_baseline.clamp(0.0, 1.0)
        };
        Self {
            time,
            authority,
            integrity: integrity.clamp(0.0, 1.0),
        }
    }
}

/// Score for the gap between the two writes: logarithmic, saturating at
/// `saturation_secs`. Unknown or non-positive gaps score zero.
pub fn time_score(gap: Option<chrono::Duration>, saturation_secs: u64) -> f64 {
    let Some(gap) = gap else { return 0.0 };
    let secs = gap.num_milliseconds() as f64 / 1000.0;
    if secs <= 0.0 || saturation_secs == 0 {
        return 0.0;
    }
    let score = (1.0 + secs).ln() / (1.0 + saturation_secs as f64).ln();
    score.clamp(0.0, 1.0)
}

pub fn confidence(strategy: &StrategyConfig, factors: &ConfidenceFactors) -> f64 {
    let w = &strategy.weights;
    let raw = strategy.base
        + w.time * factors.time
        + w.authority * factors.authority
        + w.integrity * factors.integrity;
    if raw.is_nan() {
        return 0.0;
    }
    raw.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_core::config::FactorWeights;
    use chrono::Duration;
    use rstest::rstest;

    #[rstest]
    #[case(None, 0.0)]
    #[case(Some(Duration::zero()), 0.0)]
    #[case(Some(Duration::seconds(-30)), 0.0)]
    #[case(Some(Duration::hours(24)), 1.0)]
    #[case(Some(Duration::days(30)), 1.0)]
    fn time_score_edges(#[case] gap: Option<Duration>, #[case] expected: f64) {
        assert!((time_score(gap, 86_400) - expected).abs() < 1e-9);
    }

    #[test]
    fn time_score_grows_with_the_gap() {
        let second = time_score(Some(Duration::seconds(1)), 86_400);
        let two_hours = time_score(Some(Duration::hours(2)), 86_400);
        assert!(second < 0.1);
        assert!((two_hours - 0.7814).abs() < 1e-3, "{two_hours}");
    }

    #[rstest]
    #[case(10.0, 10.0, 1.0)]
    #[case(-5.0, 0.0, 0.0)]
    #[case(0.1, 0.4, 0.1 + 0.4 * 0.5 + 0.4 * 0.5 + 0.4 * 0.5)]
    fn confidence_is_clamped_to_unit_interval(
        #[case] base: f64,
        #[case] weight: f64,
        #[case] expected: f64,
    ) {
        let strategy = StrategyConfig {
            base,
            weights: FactorWeights {
                time: weight,
                authority: weight,
                integrity: weight,
            },
            ..StrategyConfig::default()
        };
        let factors = ConfidenceFactors {
            time: 0.5,
            authority: 0.5,
            integrity: 0.5,
        };
        let value = confidence(&strategy, &factors);
        assert!((0.0..=1.0).contains(&value));
        assert!((value - expected.clamp(0.0, 1.0)).abs() < 1e-9);
    }

    #[test]
    fn nan_weights_score_zero() {
        let strategy = StrategyConfig {
            base: f64::NAN,
            ..StrategyConfig::default()
        };
        let factors = ConfidenceFactors {
            time: 1.0,
            authority: 1.0,
            integrity: 1.0,
        };
        assert_eq!(confidence(&strategy, &factors), 0.0);
    }
}
