//! Weighted trust score.

use crate::error::{Result, TrustError};
use crate::inputs::{normalize, TrustInputs};
use qlafs_consensus::ValidatorRegistry;
use qlafs_core::{now_ms, TrustConfig, TrustWeights};
use qlafs_transparency::LogEntry;
use serde::{Deserialize, Serialize};
use tracing::debug;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// A computed score with the inputs it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustScore {
    pub subject_id: String,
    /// Always within `[0, 1]`
    pub score: f64,
    pub inputs: TrustInputs,
    /// Verdicts the inputs were derived from
    pub verdicts: usize,
    pub computed_at: u64,
}

/// Pure calculator; holds only validated weights
#[derive(Debug, Clone)]
pub struct TrustCalculator {
    weights: TrustWeights,
    incident_saturation: u32,
}

pub fn validate_weights(weights: &TrustWeights) -> Result<()> {
    for (name, value) in [
        ("verification_history", weights.verification_history),
        ("consensus_participation", weights.consensus_participation),
        ("behavioral_consistency", weights.behavioral_consistency),
        ("performance_metrics", weights.performance_metrics),
        ("security_incidents", weights.security_incidents),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(TrustError::InvalidWeights(format!(
                "{} must be in [0, 1], got {}",
                name, value
            )));
        }
    }
    let sum = weights.positive_sum();
    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(TrustError::InvalidWeights(format!(
            "positive weights must sum to 1.0, got {}",
            sum
        )));
    }
    Ok(())
}

impl TrustCalculator {
    pub fn new(weights: TrustWeights, incident_saturation: u32) -> Result<Self> {
        validate_weights(&weights)?;
        Ok(Self {
            weights,
            incident_saturation,
        })
    }

    pub fn from_config(config: &TrustConfig) -> Result<Self> {
        Self::new(config.weights, config.incident_saturation)
    }

    pub fn weights(&self) -> &TrustWeights {
        &self.weights
    }

    /// `w1·history + w2·participation + w3·consistency + w4·performance
    /// − w5·incidents`, clamped to `[0, 1]`
    pub fn score(&self, inputs: &TrustInputs) -> f64 {
        let i = inputs.clamped();
        let w = &self.weights;
        let raw = w.verification_history * i.verification_history
            + w.consensus_participation * i.consensus_participation
            + w.behavioral_consistency * i.behavioral_consistency
            + w.performance_metrics * i.performance_metrics
            - w.security_incidents * i.security_incidents;
        normalize(raw)
    }

    /// Reject inputs outside `[0, 1]` instead of clamping them
    pub fn score_strict(&self, inputs: &TrustInputs) -> Result<f64> {
        for (field, value) in [
            ("verification_history", inputs.verification_history),
            ("consensus_participation", inputs.consensus_participation),
            ("behavioral_consistency", inputs.behavioral_consistency),
            ("performance_metrics", inputs.performance_metrics),
            ("security_incidents", inputs.security_incidents),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TrustError::InputOutOfRange { field, value });
            }
        }
        Ok(self.score(inputs))
    }

    /// Derive inputs from the subject's log entries and score them
    pub fn score_subject(
        &self,
        subject_id: &str,
        entries: &[LogEntry],
        registry: &ValidatorRegistry,
        performance: Option<f64>,
    ) -> TrustScore {
        let inputs =
            TrustInputs::derive(entries, registry, performance, self.incident_saturation);
        let score = self.score(&inputs);
        debug!(
            subject_id = %subject_id,
            verdicts = entries.len(),
            score,
            "Trust score computed"
        );
        TrustScore {
            subject_id: subject_id.to_string(),
            score,
            inputs,
            verdicts: entries.len(),
            computed_at: now_ms(),
        }
    }
}

impl Default for TrustCalculator {
    fn default() -> Self {
        Self {
            weights: TrustWeights::default(),
            incident_saturation: TrustConfig::default().incident_saturation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::tests::{history, registry};
    use proptest::prelude::*;
    use qlafs_consensus::Decision;

    fn all(value: f64) -> TrustInputs {
        TrustInputs {
            verification_history: value,
            consensus_participation: value,
            behavioral_consistency: value,
            performance_metrics: value,
            security_incidents: 0.0,
        }
    }

    #[test]
    fn test_default_weights_are_valid() {
        assert!(validate_weights(&TrustWeights::default()).is_ok());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let weights = TrustWeights {
            verification_history: 0.5,
            ..TrustWeights::default()
        };
        assert!(matches!(
            TrustCalculator::new(weights, 5),
            Err(TrustError::InvalidWeights(_))
        ));

        let negative = TrustWeights {
            security_incidents: -0.1,
            ..TrustWeights::default()
        };
        assert!(TrustCalculator::new(negative, 5).is_err());
    }

    #[test]
    fn test_perfect_and_empty_scores() {
        let calc = TrustCalculator::default();
        assert!((calc.score(&all(1.0)) - 1.0).abs() < 1e-9);
        assert_eq!(calc.score(&TrustInputs::default()), 0.0);
    }

    #[test]
    fn test_incidents_subtract() {
        let calc = TrustCalculator::default();
        let mut inputs = all(1.0);
        inputs.security_incidents = 1.0;
        // 1.0 - 0.10
        assert!((calc.score(&inputs) - 0.9).abs() < 1e-9);

        // Penalty cannot push below zero
        let mut low = TrustInputs::default();
        low.security_incidents = 1.0;
        assert_eq!(calc.score(&low), 0.0);
    }

    #[test]
    fn test_strict_rejects_out_of_range() {
        let calc = TrustCalculator::default();
        let mut inputs = all(0.5);
        inputs.performance_metrics = 1.2;
        assert_eq!(
            calc.score_strict(&inputs),
            Err(TrustError::InputOutOfRange {
                field: "performance_metrics",
                value: 1.2
            })
        );
    }

    #[test]
    fn test_score_subject_from_history() {
        let calc = TrustCalculator::default();
        let entries = history(&[
            (Decision::Accept, 2, &["v1", "v2"]),
            (Decision::Accept, 2, &["v1", "v2"]),
        ]);
        let score = calc.score_subject("agent-1", &entries, &registry(&["v1", "v2"]), Some(1.0));
        assert_eq!(score.verdicts, 2);
        assert!((score.score - 1.0).abs() < 1e-9);

        let unknown = calc.score_subject("agent-9", &[], &registry(&[]), None);
        assert_eq!(unknown.score, 0.0);
    }

    proptest! {
        #[test]
        fn prop_score_is_bounded(
            a in -2.0f64..2.0,
            b in -2.0f64..2.0,
            c in -2.0f64..2.0,
            d in -2.0f64..2.0,
            e in -2.0f64..2.0,
        ) {
            let inputs = TrustInputs {
                verification_history: a,
                consensus_participation: b,
                behavioral_consistency: c,
                performance_metrics: d,
                security_incidents: e,
            };
            let score = TrustCalculator::default().score(&inputs);
            prop_assert!((0.0..=1.0).contains(&score));
        }

        #[test]
        fn prop_more_incidents_never_raise_score(base in 0.0f64..=1.0, low in 0.0f64..=1.0, extra in 0.0f64..=1.0) {
            let calc = TrustCalculator::default();
            let mut fewer = all(base);
            fewer.security_incidents = low;
            let mut more = fewer;
            more.security_incidents = (low + extra).min(1.0);
            prop_assert!(calc.score(&more) <= calc.score(&fewer) + 1e-12);
        }
    }
}
