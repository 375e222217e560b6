//! Risk tier classification.

use serde::{Deserialize, Serialize};

/// Risk tier of a resource, derived from its score and the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    /// Leaf files with few dependents; effectively uncapped.
    Low,
    /// Uncapped unless configured otherwise.
    Medium,
    /// Bounded by a small configured concurrency cap.
    High,
    /// Serialized absolutely; its wave drains before any later wave starts.
    Critical,
}

impl RiskTier {
    pub fn all() -> &'static [RiskTier] {
        &[Self::Low, Self::Medium, Self::High, Self::Critical]
    }

    pub fn is_critical(self) -> bool {
        self == Self::Critical
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for RiskTier {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(crate::Error::Configuration(format!("unknown risk tier: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(RiskTier::Critical > RiskTier::High);
        assert!(RiskTier::High > RiskTier::Medium);
        assert!(RiskTier::Medium > RiskTier::Low);
    }

    #[test]
    fn test_tier_round_trip_str() {
        for tier in RiskTier::all() {
            let parsed: RiskTier = tier.to_string().parse().unwrap();
            assert_eq!(parsed, *tier);
        }
        assert!("severe".parse::<RiskTier>().is_err());
    }
}
