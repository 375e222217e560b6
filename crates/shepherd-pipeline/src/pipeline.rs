//! An ordered, resolved sequence of stages with per-stage deadlines.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::stage::{StageReport, WorkStage};
use shepherd_core::Resource;

/// How one stage invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StageRun {
    Completed(StageReport),
    /// The deadline elapsed first; distinct from a logic failure.
    TimedOut,
    /// The stage returned an error. Treated as a hard failure.
    Errored(String),
}

#[derive(Clone)]
pub struct PipelineStage {
    stage: Arc<dyn WorkStage>,
    deadline: Duration,
}

impl PipelineStage {
    pub fn new(stage: Arc<dyn WorkStage>, default_deadline: Duration) -> Self {
        let deadline = stage.timeout().unwrap_or(default_deadline);
        Self { stage, deadline }
    }

    pub fn name(&self) -> &str {
        self.stage.name()
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn stage(&self) -> &Arc<dyn WorkStage> {
        &self.stage
    }

    /// Run the stage under its deadline.
    pub async fn execute(&self, resource: &Resource, content: &[u8]) -> StageRun {
        match tokio::time::timeout(self.deadline, self.stage.run(resource, content)).await {
            Ok(Ok(report)) => StageRun::Completed(report),
            Ok(Err(e)) => {
                warn!("Stage '{}' errored on {}: {}", self.name(), resource.id, e);
                StageRun::Errored(e.to_string())
            }
            Err(_) => {
                warn!(
                    "Stage '{}' timed out on {} after {:?}",
                    self.name(),
                    resource.id,
                    self.deadline
                );
                StageRun::TimedOut
            }
        }
    }
}

impl std::fmt::Debug for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStage")
            .field("name", &self.name())
            .field("kind", &self.stage.kind())
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Stages applied, in order, to every resource of a session.
#[derive(Debug, Clone, Default)]
pub struct WorkPipeline {
    stages: Vec<PipelineStage>,
}

impl WorkPipeline {
    pub fn new(stages: Vec<PipelineStage>) -> Self {
        Self { stages }
    }

    /// Sum of every stage's estimate for a resource of `size_bytes`.
    pub fn estimate_cost(&self, resource: &Resource, size_bytes: u64) -> u64 {
        self.stages.iter().fold(0u64, |total, s| {
            total.saturating_add(s.stage.estimate_cost(resource, size_bytes))
        })
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shepherd_core::config::StageKind;
    use shepherd_core::{Error, ResourceId, Result, RiskTier};

    struct Sleepy {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl WorkStage for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn kind(&self) -> StageKind {
            StageKind::Verify
        }
        fn estimate_cost(&self, _resource: &Resource, size_bytes: u64) -> u64 {
            size_bytes + 1
        }
        async fn run(&self, _resource: &Resource, _content: &[u8]) -> Result<StageReport> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::Stage("verifier crashed".into()));
            }
            Ok(StageReport::ok(1))
        }
    }

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

    fn stage(delay_ms: u64, fail: bool) -> PipelineStage {
        PipelineStage::new(
            Arc::new(Sleepy {
                delay: Duration::from_millis(delay_ms),
                fail,
            }),
            Duration::from_secs(1),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded_is_timeout() {
        let run = stage(5_000, false).execute(&resource(), b"").await;
        assert_eq!(run, StageRun::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_and_completion() {
        assert!(matches!(
            stage(10, true).execute(&resource(), b"").await,
            StageRun::Errored(msg) if msg.contains("verifier crashed")
        ));
        assert_eq!(
            stage(10, false).execute(&resource(), b"").await,
            StageRun::Completed(StageReport::ok(1))
        );
    }

    #[test]
    fn test_estimate_sums_stages() {
        let pipeline = WorkPipeline::new(vec![stage(0, false), stage(0, false)]);
        assert_eq!(pipeline.estimate_cost(&resource(), 3), 8);
        assert_eq!(pipeline.names(), vec!["sleepy", "sleepy"]);
    }
}
