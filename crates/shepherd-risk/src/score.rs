//! Risk score and tier classification.

use shepherd_core::config::{RiskWeights, TierThresholds};
use shepherd_core::RiskTier;

/// Inputs of the risk formula for a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RiskInputs {
    /// Number of resources that depend on this one (fan-in).
    pub dependents: usize,
    pub complexity: f64,
    pub criticality: f64,
}

/// `dependents*w1 + complexity*w2 + criticality*w3`.
pub fn risk_score(inputs: &RiskInputs, weights: &RiskWeights) -> f64 {
    inputs.dependents as f64 * weights.dependents
        + inputs.complexity * weights.complexity
        + inputs.criticality * weights.criticality
}

/// Bucket a score into a tier. Thresholds are inclusive lower bounds.
pub fn classify(score: f64, thresholds: &TierThresholds) -> RiskTier {
    if score >= thresholds.critical {
        RiskTier::Critical
    } else if score >= thresholds.high {
        RiskTier::High
    } else if score >= thresholds.medium {
        RiskTier::Medium
    } else {
        RiskTier::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_is_weighted_sum() {
        let weights = RiskWeights {
            dependents: 1.0,
            complexity: 0.5,
            criticality: 2.0,
        };
        let inputs = RiskInputs {
            dependents: 3,
            complexity: 4.0,
            criticality: 5.0,
        };
        assert_eq!(risk_score(&inputs, &weights), 3.0 + 2.0 + 10.0);
    }

    #[test]
    fn test_zero_weights_zero_score() {
        let weights = RiskWeights {
            dependents: 0.0,
            complexity: 0.0,
            criticality: 0.0,
        };
        let inputs = RiskInputs {
            dependents: 100,
            complexity: 9.0,
            criticality: 9.0,
        };
        assert_eq!(risk_score(&inputs, &weights), 0.0);
    }

    #[test]
    fn test_classify_boundaries() {
        let t = TierThresholds::default();
        assert_eq!(classify(t.critical, &t), RiskTier::Critical);
        assert_eq!(classify(t.critical - 0.01, &t), RiskTier::High);
        assert_eq!(classify(t.high, &t), RiskTier::High);
        assert_eq!(classify(t.medium, &t), RiskTier::Medium);
        assert_eq!(classify(0.0, &t), RiskTier::Low);
    }
}
