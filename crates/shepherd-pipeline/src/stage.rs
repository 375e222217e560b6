//! The stage contract.

use std::time::Duration;

use async_trait::async_trait;

use shepherd_core::config::StageKind;
use shepherd_core::{Finding, Resource, Result, StageOutcome};

/// What a stage did to one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    /// New content of the resource, if the stage rewrote it.
    pub modified: Option<Vec<u8>>,
    pub findings: Vec<Finding>,
    /// Units actually consumed.
    pub cost: u64,
    pub outcome: StageOutcome,
}

impl StageReport {
    pub fn ok(cost: u64) -> Self {
        Self {
            modified: None,
            findings: Vec::new(),
            cost,
            outcome: StageOutcome::Ok,
        }
    }

    pub fn hard_failure(cost: u64, message: impl Into<String>) -> Self {
        Self {
            outcome: StageOutcome::HardFailure(message.into()),
            ..Self::ok(cost)
        }
    }

    pub fn with_modified(mut self, content: Vec<u8>) -> Self {
        self.modified = Some(content);
        self
    }

    pub fn with_finding(mut self, finding: Finding) -> Self {
        self.findings.push(finding);
        self
    }
}

/// A step of the inspect → transform → verify sequence.
///
/// Returning `Err` from `run` is treated exactly like a hard failure.
#[async_trait]
pub trait WorkStage: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> StageKind;

    /// Units this stage is expected to consume on a resource of `size_bytes`.
    fn estimate_cost(&self, resource: &Resource, size_bytes: u64) -> u64;

    /// Stage-specific deadline; the pipeline default applies when `None`.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn run(&self, resource: &Resource, content: &[u8]) -> Result<StageReport>;
}
