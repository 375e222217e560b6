//! Processing of one admitted, locked resource.
//!
//! The worker runs the pipeline stages in order, writing modified content after each
//! stage. A hard failure, an erroring stage or a missed deadline restores the
//! resource from its backup. Cancellation is observed between stages only; the
//! resource is then restored and reported as rolled back.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::budget::Reservation;
use crate::cancel::CancelToken;
use crate::lock::LockTable;
use crate::workspace::Workspace;
use shepherd_core::{
    Error, FailureReason, Finding, Resource, ResourceId, StageOutcome, StageRecord, WorkStatus,
};
use shepherd_pipeline::{StageRun, WorkPipeline};
use shepherd_store::Lock;

/// Shared handles every worker needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub pipeline: Arc<WorkPipeline>,
    pub workspace: Arc<dyn Workspace>,
    pub locks: Arc<LockTable>,
    pub cancel: CancelToken,
    pub lock_ttl: Duration,
}

/// A resource that has passed admission and holds its lock.
pub struct WorkItem {
    pub resource: Resource,
    pub lock: Lock,
    pub reservation: Reservation,
}

/// Everything the driver loop needs to settle, record and release.
pub struct WorkerOutcome {
    pub resource_id: ResourceId,
    pub lock: Lock,
    pub reservation: Reservation,
    pub status: WorkStatus,
    pub stages: Vec<StageRecord>,
    pub findings: Vec<Finding>,
    pub cost: u64,
    pub failure: Option<FailureReason>,
}

enum Halt {
    Rollback(FailureReason),
    Cancelled,
    LockLost,
}

pub async fn process(ctx: WorkerContext, item: WorkItem) -> WorkerOutcome {
    let WorkItem {
        resource,
        mut lock,
        reservation,
    } = item;
    let mut stages = Vec::new();
    let mut findings = Vec::new();
    let mut cost = 0u64;

    let halt = run_stages(&ctx, &resource, &mut lock, &mut stages, &mut findings, &mut cost).await;

    let (status, failure) = match halt {
        None => {
            debug!("Completed {} ({} units)", resource.id, cost);
            (WorkStatus::Completed, None)
        }
        Some(Halt::Rollback(reason)) => match restore(&ctx, &resource.id, reason) {
            Ok(reason) => {
                info!("Rolled back {}: {}", resource.id, reason);
                (WorkStatus::Failed, Some(reason))
            }
            Err(reason) => (WorkStatus::Failed, Some(reason)),
        },
        Some(Halt::Cancelled) => match restore(&ctx, &resource.id, FailureReason::Cancelled) {
            Ok(reason) => {
                info!("Rolled back {} after cancellation", resource.id);
                (WorkStatus::RolledBack, Some(reason))
            }
            Err(reason) => (WorkStatus::Failed, Some(reason)),
        },
        Some(Halt::LockLost) => {
            warn!(
                "Lost lock on {}; leaving content to the new holder",
                resource.id
            );
            (WorkStatus::Failed, Some(FailureReason::LockLost))
        }
    };

    WorkerOutcome {
        resource_id: resource.id,
        lock,
        reservation,
        status,
        stages,
        findings,
        cost,
        failure,
    }
}

/// Put the backup back after `reason` stopped the pipeline. A failed or impossible
/// restore becomes `RestoreFailed`, which keeps the resource's backup for resume.
fn restore(
    ctx: &WorkerContext,
    resource: &ResourceId,
    reason: FailureReason,
) -> std::result::Result<FailureReason, FailureReason> {
    let message = match ctx.locks.restore(resource) {
        Ok(true) => return Ok(reason),
        Ok(false) => "no backup recorded".to_string(),
        Err(e) => e.to_string(),
    };
    error!(
        "Failed to restore {} after {}: {}; content may be half-applied",
        resource, reason, message
    );
    Err(FailureReason::RestoreFailed {
        after: reason.to_string(),
        message,
    })
}

async fn run_stages(
    ctx: &WorkerContext,
    resource: &Resource,
    lock: &mut Lock,
    records: &mut Vec<StageRecord>,
    findings: &mut Vec<Finding>,
    cost: &mut u64,
) -> Option<Halt> {
    let mut content = match ctx.workspace.read(&resource.id) {
        Ok(content) => content.unwrap_or_default(),
        Err(e) => {
            return Some(Halt::Rollback(FailureReason::Internal {
                message: format!("read failed: {e}"),
            }))
        }
    };

    for stage in ctx.pipeline.stages() {
        if ctx.cancel.is_cancelled() {
            return Some(Halt::Cancelled);
        }
        match ctx.locks.renew(lock, ctx.lock_ttl.max(stage.deadline())) {
            Ok(()) => {}
            Err(Error::LockLost(_)) => return Some(Halt::LockLost),
            Err(e) => {
                return Some(Halt::Rollback(FailureReason::Internal {
                    message: format!("lock renewal failed: {e}"),
                }))
            }
        }

        let name = stage.name().to_string();
        let started = Instant::now();
        let run = stage.execute(resource, &content).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let report = match run {
            StageRun::Completed(report) => report,
            StageRun::TimedOut => {
                let charged = stage.stage().estimate_cost(resource, content.len() as u64);
                *cost += charged;
                records.push(StageRecord {
                    stage: name.clone(),
                    outcome: StageOutcome::HardFailure("deadline exceeded".into()),
                    cost: charged,
                    modified: false,
                    duration_ms,
                });
                return Some(Halt::Rollback(FailureReason::StageTimeout { stage: name }));
            }
            StageRun::Errored(message) => {
                let charged = stage.stage().estimate_cost(resource, content.len() as u64);
                *cost += charged;
                records.push(StageRecord {
                    stage: name.clone(),
                    outcome: StageOutcome::HardFailure(message.clone()),
                    cost: charged,
                    modified: false,
                    duration_ms,
                });
                return Some(Halt::Rollback(FailureReason::StageHardFailure {
                    stage: name,
                    message,
                }));
            }
        };

        *cost += report.cost;
        findings.extend(report.findings);
        let modified = report.modified.is_some();
        records.push(StageRecord {
            stage: name.clone(),
            outcome: report.outcome.clone(),
            cost: report.cost,
            modified,
            duration_ms,
        });

        if let StageOutcome::HardFailure(message) = report.outcome {
            return Some(Halt::Rollback(FailureReason::StageHardFailure {
                stage: name,
                message,
            }));
        }
        if let StageOutcome::SoftFailure(message) = &report.outcome {
            debug!("Stage '{}' soft failure on {}: {}", name, resource.id, message);
        }

        if let Some(next) = report.modified {
            if let Err(e) = ctx.workspace.write(&resource.id, &next) {
                return Some(Halt::Rollback(FailureReason::Internal {
                    message: format!("write failed: {e}"),
                }));
            }
            content = next;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{Admission, BudgetLedger};
    use crate::lock::Acquire;
    use crate::workspace::InMemoryWorkspace;
    use async_trait::async_trait;
    use shepherd_core::config::{StageKind, WindowConfig, WindowKind};
    use shepherd_core::{Clock, ManualClock, Result, RiskTier};
    use shepherd_pipeline::{PipelineStage, StageReport, WorkStage};
    use shepherd_store::SqliteStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rewrites the file, then reports the configured outcome.
    struct Rewrite {
        name: &'static str,
        outcome: StageOutcome,
        delay: Duration,
    }

    #[async_trait]
    impl WorkStage for Rewrite {
        fn name(&self) -> &str {
            self.name
        }
        fn kind(&self) -> StageKind {
            StageKind::Transform
        }
        fn estimate_cost(&self, _resource: &Resource, _size: u64) -> u64 {
            1
        }
        async fn run(&self, _resource: &Resource, content: &[u8]) -> Result<StageReport> {
            tokio::time::sleep(self.delay).await;
            let mut next = content.to_vec();
            next.extend_from_slice(self.name.as_bytes());
            Ok(StageReport {
                modified: Some(next),
                findings: Vec::new(),
                cost: 1,
                outcome: self.outcome.clone(),
            })
        }
    }

    fn stage(name: &'static str, outcome: StageOutcome, delay_ms: u64) -> PipelineStage {
        PipelineStage::new(
            Arc::new(Rewrite {
                name,
                outcome,
                delay: Duration::from_millis(delay_ms),
            }),
            Duration::from_secs(1),
        )
    }

    struct Setup {
        ctx: WorkerContext,
        workspace: Arc<InMemoryWorkspace>,
        item: WorkItem,
    }

    /// Lets `writes` writes through, then fails every later one.
    struct FailingWrites {
        inner: Arc<InMemoryWorkspace>,
        writes: AtomicUsize,
    }

    impl Workspace for FailingWrites {
        fn read(&self, resource: &ResourceId) -> Result<Option<Vec<u8>>> {
            self.inner.read(resource)
        }
        fn write(&self, resource: &ResourceId, content: &[u8]) -> Result<()> {
            self.writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .map_err(|_| Error::Storage(format!("{resource}: no space left")))?;
            self.inner.write(resource, content)
        }
        fn remove(&self, resource: &ResourceId) -> Result<()> {
            self.inner.remove(resource)
        }
    }

    fn setup(stages: Vec<PipelineStage>) -> Setup {
        setup_with(stages, |files| files as Arc<dyn Workspace>)
    }

    fn setup_with(
        stages: Vec<PipelineStage>,
        wrap: impl FnOnce(Arc<InMemoryWorkspace>) -> Arc<dyn Workspace>,
    ) -> Setup {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_epoch());
        let files = Arc::new(InMemoryWorkspace::with_files([("a.rs", &b"v0:"[..])]));
        let workspace = wrap(files.clone());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let locks = Arc::new(LockTable::new(store, workspace.clone(), clock.clone(), "s1"));
        let resource = Resource {
            id: ResourceId::from("a.rs"),
            path: "a.rs".into(),
            risk: 0.0,
            tier: RiskTier::Low,
            wave: 0,
            dependents: Vec::new(),
            complexity: 0.0,
            criticality: 0.0,
        };
        let lock = match locks
            .acquire(&resource.id, "w1", Duration::from_secs(30))
            .unwrap()
        {
            Acquire::Granted(lock) => lock,
            other => panic!("unexpected {other:?}"),
        };
        let ledger = BudgetLedger::new(
            &[WindowConfig {
                kind: WindowKind::Session,
                limit: 100,
            }],
            "s1",
            clock,
        );
        let reservation = match ledger.reserve(3).unwrap() {
            Admission::Reserved(r) => r,
            other => panic!("unexpected {other:?}"),
        };
        Setup {
            ctx: WorkerContext {
                pipeline: Arc::new(WorkPipeline::new(stages)),
                workspace,
                locks,
                cancel: CancelToken::new(),
                lock_ttl: Duration::from_secs(30),
            },
            workspace: files,
            item: WorkItem {
                resource,
                lock,
                reservation,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_stages_apply() {
        let s = setup(vec![
            stage("inspect", StageOutcome::Ok, 0),
            stage("fix", StageOutcome::SoftFailure("style".into()), 0),
        ]);
        let outcome = process(s.ctx, s.item).await;
        assert_eq!(outcome.status, WorkStatus::Completed);
        assert_eq!(outcome.cost, 2);
        assert_eq!(outcome.stages.len(), 2);
        assert_eq!(s.workspace.get("a.rs"), Some(b"v0:inspectfix".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_failure_restores_backup() {
        let s = setup(vec![
            stage("fix", StageOutcome::Ok, 0),
            stage("verify", StageOutcome::HardFailure("tests fail".into()), 0),
            stage("never", StageOutcome::Ok, 0),
        ]);
        let outcome = process(s.ctx, s.item).await;
        assert_eq!(outcome.status, WorkStatus::Failed);
        assert_eq!(
            outcome.failure,
            Some(FailureReason::StageHardFailure {
                stage: "verify".into(),
                message: "tests fail".into()
            })
        );
        assert_eq!(outcome.stages.len(), 2);
        assert_eq!(s.workspace.get("a.rs"), Some(b"v0:".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_restores_backup() {
        let s = setup(vec![
            stage("fix", StageOutcome::Ok, 0),
            stage("slow", StageOutcome::Ok, 5_000),
        ]);
        let outcome = process(s.ctx, s.item).await;
        assert_eq!(
            outcome.failure,
            Some(FailureReason::StageTimeout {
                stage: "slow".into()
            })
        );
        assert_eq!(s.workspace.get("a.rs"), Some(b"v0:".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_between_stages_rolls_back() {
        let s = setup(vec![
            stage("fix", StageOutcome::Ok, 100),
            stage("verify", StageOutcome::Ok, 0),
        ]);
        let cancel = s.ctx.cancel.clone();
        let handle = tokio::spawn(process(s.ctx, s.item));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status, WorkStatus::RolledBack);
        // The running stage finished before the rollback.
        assert_eq!(outcome.stages.len(), 1);
        assert_eq!(s.workspace.get("a.rs"), Some(b"v0:".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_restore_is_reported() {
        let s = setup_with(
            vec![
                stage("fix", StageOutcome::Ok, 0),
                stage("verify", StageOutcome::HardFailure("tests fail".into()), 0),
            ],
            |files| {
                Arc::new(FailingWrites {
                    inner: files,
                    writes: AtomicUsize::new(1),
                }) as Arc<dyn Workspace>
            },
        );
        let outcome = process(s.ctx, s.item).await;
        assert_eq!(outcome.status, WorkStatus::Failed);
        let failure = outcome.failure.unwrap();
        assert!(failure.needs_repair());
        match failure {
            FailureReason::RestoreFailed { after, message } => {
                assert!(after.contains("verify"), "{after}");
                assert!(message.contains("no space left"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
        // The half-applied content is still there for resume to repair.
        assert_eq!(s.workspace.get("a.rs"), Some(b"v0:fix".to_vec()));
    }
}
