//! Inspect stage that records a content fingerprint. Never modifies the resource.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::stage::{StageReport, WorkStage};
use shepherd_core::config::{CostModel, StageKind};
use shepherd_core::{Finding, Resource, Result};

pub struct FingerprintStage {
    cost: CostModel,
}

impl FingerprintStage {
    pub const NAME: &'static str = "fingerprint";

    pub fn new(cost: CostModel) -> Self {
        Self { cost }
    }
}

impl Default for FingerprintStage {
    fn default() -> Self {
        Self::new(CostModel { base: 1, per_kib: 1 })
    }
}

#[async_trait]
impl WorkStage for FingerprintStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn kind(&self) -> StageKind {
        StageKind::Inspect
    }

    fn estimate_cost(&self, _resource: &Resource, size_bytes: u64) -> u64 {
        self.cost.estimate(size_bytes)
    }

    async fn run(&self, resource: &Resource, content: &[u8]) -> Result<StageReport> {
        let digest = hex::encode(Sha256::digest(content));
        let lines = content.iter().filter(|b| **b == b'\n').count();
        Ok(StageReport::ok(self.cost.estimate(content.len() as u64)).with_finding(Finding {
            stage: Self::NAME.to_string(),
            message: format!("sha256 {}", digest),
            detail: Some(serde_json::json!({
                "path": resource.path,
                "bytes": content.len(),
                "lines": lines,
                "sha256": digest,
            })),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_core::{ResourceId, RiskTier, StageOutcome};

    fn resource() -> Resource {
        Resource {
            id: ResourceId::from("a.rs"),
            path: "a.rs".into(),
            risk: 0.0,
            tier: RiskTier::Low,
            wave: 0,
            dependents: Vec::new(),
            complexity: 0.0,
            criticality: 0.0,
        }
    }

    #[tokio::test]
    async fn test_fingerprint_reports_digest() {
        let stage = FingerprintStage::default();
        let report = stage.run(&resource(), b"fn main() {}\n").await.unwrap();
        assert_eq!(report.outcome, StageOutcome::Ok);
        assert!(report.modified.is_none());
        assert_eq!(report.cost, 2);
        let detail = report.findings[0].detail.as_ref().unwrap();
        assert_eq!(detail["lines"], 1);
        assert_eq!(detail["sha256"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_estimate_scales_with_size() {
        let stage = FingerprintStage::default();
        assert_eq!(stage.estimate_cost(&resource(), 0), 1);
        assert_eq!(stage.estimate_cost(&resource(), 4096), 5);
    }
}
