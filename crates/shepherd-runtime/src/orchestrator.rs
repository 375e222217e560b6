//! The driver loop that ties ledger, locks, pipeline and sessions together.
//!
//! One loop owns the session and every resource state. It admits eligible resources
//! from the risk graph into a bounded pool of workers, settles and records each
//! outcome as it arrives, and checkpoints progress. Workers only touch the workspace
//! and their own lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::budget::{Admission, BudgetLedger};
use crate::cancel::CancelToken;
use crate::lock::{Acquire, LockTable};
use crate::types::RunReport;
use crate::worker::{self, WorkItem, WorkerContext, WorkerOutcome};
use crate::workspace::Workspace;
use shepherd_core::{
    Clock, Error, FailureReason, Resource, ResourceId, ResourceState, ResourceStates, Result,
    SessionManifest, SessionStatus, ShepherdConfig, WorkResult, WorkStatus,
};
use shepherd_pipeline::WorkPipeline;
use shepherd_risk::RiskGraph;
use shepherd_store::{ProgressSnapshot, Session, SessionItem, SessionStore};

pub struct Orchestrator {
    config: ShepherdConfig,
    sessions: Arc<SessionStore>,
    workspace: Arc<dyn Workspace>,
    clock: Arc<dyn Clock>,
    pipeline: Arc<WorkPipeline>,
    cancel: CancelToken,
    holder_prefix: String,
}

/// Mutable state of one run, owned by the driver loop.
struct Run {
    session: Session,
    states: ResourceStates,
    since_checkpoint: usize,
    last_checkpoint: Instant,
    next_holder: u64,
    /// Resources whose rollback failed. Their locks and backups are kept.
    unrestored: Vec<ResourceId>,
}

/// Why admission stopped filling the pool.
enum Stall {
    /// Every eligible resource is admitted or the pool is full.
    None,
    /// A budget window is out of headroom; `None` when it never resets.
    Budget(Option<Duration>),
}

impl Orchestrator {
    pub fn new(
        config: ShepherdConfig,
        sessions: Arc<SessionStore>,
        workspace: Arc<dyn Workspace>,
        clock: Arc<dyn Clock>,
        pipeline: WorkPipeline,
    ) -> Self {
        Self {
            config,
            sessions,
            workspace,
            clock,
            pipeline: Arc::new(pipeline),
            cancel: CancelToken::new(),
            holder_prefix: format!(
                "pid{}-{}",
                std::process::id(),
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            ),
        }
    }

    /// Token that stops admission and rolls back running work between stages.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Create a session over every resource of `graph` and drive it to an end state.
    pub async fn start(&self, graph: &RiskGraph, manifest: SessionManifest) -> Result<RunReport> {
        let items: Vec<SessionItem> = graph
            .resources()
            .iter()
            .map(|r| SessionItem {
                resource_id: r.id.clone(),
                path: r.path.to_string_lossy().into_owned(),
                tier: r.tier,
                wave: r.wave,
                risk: r.risk,
            })
            .collect();
        let session = self.sessions.create(manifest, &items)?;
        info!(
            "Starting session {}: {} resources in {} waves, pipeline [{}]",
            session.id,
            graph.len(),
            graph.wave_count(),
            self.pipeline.names().join(", ")
        );

        let states = ResourceStates::pending(graph.resources().iter().map(|r| &r.id));
        let ledger = self.ledger_for(&session.id)?;
        let locks = self.locks_for(&session.id);
        self.drive(graph, session, states, ledger, locks).await
    }

    /// Continue a non-terminal session. Completed resources are skipped; everything
    /// else runs again after any half-applied content is restored from backup.
    ///
    /// The graph is rebuilt from the items recorded at start, so tiers and waves
    /// match the original run even if the feed has changed since.
    ///
    /// The latest checkpoint must verify and agree with the recorded results, or
    /// resume fails with `CheckpointCorruption`. Resource states then come from the
    /// results, which are committed before any checkpoint that counts them and so
    /// cover everything the checkpoint knows plus any item finished after it.
    pub async fn resume(&self, session_id: &str) -> Result<RunReport> {
        let (session, checkpoint) = self.sessions.resume(session_id)?;
        let graph = self.recorded_graph(&session.id)?;
        if let Some(checkpoint) = &checkpoint {
            info!(
                "Resuming session {} from checkpoint {} ({} completed, {} failed)",
                session.id,
                checkpoint.seq,
                checkpoint.snapshot.completed_items,
                checkpoint.snapshot.failed_items
            );
        } else {
            info!("Resuming session {} without a checkpoint", session.id);
        }

        let mut states = ResourceStates::new();
        for resource in graph.resources() {
            let state = if session.is_completed(&resource.id) {
                ResourceState::Completed
            } else {
                ResourceState::Pending
            };
            states.set(&resource.id, state);
        }

        let locks = self.locks_for(&session.id);
        let mut restored = 0;
        for resource in locks.backed_up()? {
            if !session.is_completed(&resource) && locks.restore_after_crash(&resource)? {
                restored += 1;
            }
        }
        if restored > 0 {
            warn!(
                "Restored {} resources left mid-modification in session {}",
                restored, session.id
            );
        }

        let ledger = self.ledger_for(&session.id)?;
        ledger.rebase_session_window(self.sessions.store().total_cost(&session.id)?)?;
        self.drive(&graph, session, states, ledger, locks).await
    }

    fn recorded_graph(&self, session_id: &str) -> Result<RiskGraph> {
        let resources = self
            .sessions
            .store()
            .session_items(session_id)?
            .into_iter()
            .map(|item| Resource {
                id: item.resource_id,
                path: PathBuf::from(item.path),
                risk: item.risk,
                tier: item.tier,
                wave: item.wave,
                dependents: Vec::new(),
                complexity: 0.0,
                criticality: 0.0,
            })
            .collect();
        Ok(RiskGraph::from_resources(resources, &self.config.risk))
    }

    fn ledger_for(&self, session_id: &str) -> Result<BudgetLedger> {
        BudgetLedger::with_store(
            &self.config.budget.windows,
            session_id,
            self.clock.clone(),
            self.sessions.store().clone(),
        )
    }

    fn locks_for(&self, session_id: &str) -> LockTable {
        LockTable::new(
            self.sessions.store().clone(),
            self.workspace.clone(),
            self.clock.clone(),
            session_id,
        )
    }

    async fn drive(
        &self,
        graph: &RiskGraph,
        session: Session,
        states: ResourceStates,
        ledger: BudgetLedger,
        locks: LockTable,
    ) -> Result<RunReport> {
        let sched = self.config.scheduler;
        let cancel_poll = Duration::from_millis(sched.cancel_poll_ms.max(1));
        let checkpoint_interval = Duration::from_secs(sched.checkpoint_interval_secs);
        let max_backoff = Duration::from_secs(sched.max_backoff_secs);
        let busy_backoff = self.config.locks.busy_backoff();

        let locks = Arc::new(locks);
        let ctx = WorkerContext {
            pipeline: self.pipeline.clone(),
            workspace: self.workspace.clone(),
            locks: locks.clone(),
            cancel: self.cancel.clone(),
            lock_ttl: self.config.locks.ttl(),
        };
        let mut run = Run {
            session,
            states,
            since_checkpoint: 0,
            last_checkpoint: Instant::now(),
            next_holder: 0,
            unrestored: Vec::new(),
        };
        let mut workers: JoinSet<WorkerOutcome> = JoinSet::new();
        let mut next_poll = Instant::now();
        let mut undefer_at: Option<Instant> = None;
        let mut cancelled = false;

        loop {
            let now = Instant::now();
            if !cancelled {
                if now >= next_poll {
                    next_poll = now + cancel_poll;
                    if self.sessions.cancel_requested(&run.session.id)? {
                        self.cancel.cancel();
                    }
                }
                if self.cancel.is_cancelled() {
                    cancelled = true;
                    info!(
                        "Cancellation observed for session {}: waiting for {} running",
                        run.session.id,
                        workers.len()
                    );
                }
            }

            if undefer_at.is_some_and(|at| now >= at) {
                undefer_at = None;
                let retried = run.states.undefer_all();
                debug!("Retrying {} resources deferred on busy locks", retried);
            }

            let stall = if cancelled {
                Stall::None
            } else {
                self.admit(graph, &mut run, &ledger, &locks, &ctx, &mut workers)?
            };
            if undefer_at.is_none() && run.states.count(ResourceState::Deferred) > 0 {
                undefer_at = Some(now + busy_backoff);
            }

            if run.since_checkpoint > 0
                && (run.since_checkpoint >= sched.checkpoint_every_items
                    || run.last_checkpoint.elapsed() >= checkpoint_interval)
            {
                self.checkpoint(&mut run, &ledger)?;
            }

            if workers.is_empty() {
                if !run.unrestored.is_empty() && (cancelled || !run.states.any_outstanding()) {
                    self.checkpoint(&mut run, &ledger)?;
                    error!(
                        "Session {} left active: rollback failed for {}; resume to restore",
                        run.session.id,
                        run.unrestored
                            .iter()
                            .map(|id| id.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    break;
                }
                if cancelled {
                    self.checkpoint(&mut run, &ledger)?;
                    self.sessions
                        .finalize(&mut run.session, SessionStatus::Aborted)?;
                    break;
                }
                if !run.states.any_outstanding() {
                    self.checkpoint(&mut run, &ledger)?;
                    self.sessions
                        .finalize(&mut run.session, SessionStatus::Completed)?;
                    break;
                }
                match stall {
                    Stall::Budget(None) => {
                        info!(
                            "Session {} budget exhausted with {} resources outstanding",
                            run.session.id,
                            run.states.iter().filter(|(_, s)| s.is_outstanding()).count()
                        );
                        self.checkpoint(&mut run, &ledger)?;
                        self.sessions.pause(&mut run.session)?;
                        break;
                    }
                    Stall::None if undefer_at.is_none() => {
                        return Err(Error::Internal(format!(
                            "session {} stalled: nothing running, nothing eligible",
                            run.session.id
                        )));
                    }
                    _ => {}
                }
            }

            let mut wake_at = (!cancelled).then_some(next_poll);
            if let Stall::Budget(Some(retry)) = stall {
                let retry_at = now + retry.min(max_backoff).max(Duration::from_millis(1));
                wake_at = Some(wake_at.map_or(retry_at, |at| at.min(retry_at)));
            }
            if let Some(at) = undefer_at {
                wake_at = Some(wake_at.map_or(at, |w| w.min(at)));
            }
            let sleep_until = wake_at.unwrap_or(now);

            tokio::select! {
                joined = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Some(Ok(outcome)) => self.complete(&mut run, &ledger, &locks, outcome)?,
                        Some(Err(e)) => {
                            return Err(Error::Internal(format!("worker task failed: {e}")));
                        }
                        None => {}
                    }
                }
                _ = tokio::time::sleep_until(sleep_until), if wake_at.is_some() => {}
                _ = self.cancel.cancelled(), if !cancelled => {}
            }
        }

        let report = RunReport::from_session(&run.session, locks.recovery_events()?.len());
        info!(
            "Session {} {}: {} completed, {} failed, {} pending",
            report.session_id, report.status, report.completed, report.failed, report.pending
        );
        Ok(report)
    }

    /// Fill the worker pool with eligible resources.
    fn admit(
        &self,
        graph: &RiskGraph,
        run: &mut Run,
        ledger: &BudgetLedger,
        locks: &LockTable,
        ctx: &WorkerContext,
        workers: &mut JoinSet<WorkerOutcome>,
    ) -> Result<Stall> {
        while workers.len() < self.config.scheduler.workers {
            let Some(resource) = graph.next_eligible(&run.states) else {
                return Ok(Stall::None);
            };
            let resource = resource.clone();

            let size = match self.workspace.read(&resource.id) {
                Ok(content) => content.map_or(0, |c| c.len() as u64),
                Err(e) => {
                    self.fail_unstarted(
                        run,
                        &resource,
                        FailureReason::Internal {
                            message: format!("read failed: {e}"),
                        },
                    )?;
                    continue;
                }
            };
            let estimate = self.pipeline.estimate_cost(&resource, size);

            let reservation = match ledger.reserve(estimate)? {
                Admission::Reserved(reservation) => reservation,
                Admission::Denied { retry_after } => return Ok(Stall::Budget(retry_after)),
                Admission::PermanentlyOversized { window, limit } => {
                    warn!(
                        "{} needs {} units, more than the {} window allows ({})",
                        resource.id, estimate, window, limit
                    );
                    self.fail_unstarted(
                        run,
                        &resource,
                        FailureReason::PermanentlyOversized { estimate, limit },
                    )?;
                    continue;
                }
            };

            run.next_holder += 1;
            let holder = format!("{}/w{}", self.holder_prefix, run.next_holder);
            let acquired = match locks.acquire(&resource.id, &holder, self.config.locks.ttl()) {
                Ok(acquired) => acquired,
                Err(e) => {
                    if let Err(release) = ledger.release(reservation) {
                        warn!("Failed to return reservation for {}: {}", resource.id, release);
                    }
                    return Err(e);
                }
            };
            match acquired {
                Acquire::Granted(lock) => {
                    debug!(
                        "Admitted {} ({} tier, wave {}, {} units reserved)",
                        resource.id,
                        resource.tier,
                        resource.wave,
                        reservation.amount()
                    );
                    run.states.set(&resource.id, ResourceState::InProgress);
                    workers.spawn(worker::process(
                        ctx.clone(),
                        WorkItem {
                            resource,
                            lock,
                            reservation,
                        },
                    ));
                }
                Acquire::Busy { holder, expires_at } => {
                    ledger.release(reservation)?;
                    debug!(
                        "Deferring {}: locked by {} until {}",
                        resource.id, holder, expires_at
                    );
                    run.states.set(&resource.id, ResourceState::Deferred);
                }
            }
        }
        Ok(Stall::None)
    }

    /// Settle, record, release, then move the resource to its final state.
    fn complete(
        &self,
        run: &mut Run,
        ledger: &BudgetLedger,
        locks: &LockTable,
        outcome: WorkerOutcome,
    ) -> Result<()> {
        let settlement = ledger.settle(outcome.reservation, outcome.cost)?;
        let id = outcome.resource_id;
        let unrestored = outcome
            .failure
            .as_ref()
            .is_some_and(FailureReason::needs_repair);
        match (&outcome.status, &outcome.failure) {
            (WorkStatus::Failed, Some(reason)) => warn!("{} failed: {}", id, reason),
            (status, _) => debug!("{} {} ({} units)", id, status.as_str(), outcome.cost),
        }

        self.sessions.record_result(
            &mut run.session,
            WorkResult {
                resource_id: id.clone(),
                status: outcome.status,
                stages: outcome.stages,
                findings: outcome.findings,
                cost: outcome.cost,
                overrun: settlement.overrun,
                failure: outcome.failure,
                recorded_at: self.clock.now(),
            },
        )?;
        if unrestored {
            run.unrestored.push(id.clone());
        } else {
            locks.release(&outcome.lock)?;
        }

        let state = match outcome.status {
            WorkStatus::Completed => ResourceState::Completed,
            WorkStatus::Failed => ResourceState::Failed,
            WorkStatus::RolledBack => ResourceState::Pending,
        };
        run.states.set(&id, state);
        run.since_checkpoint += 1;
        Ok(())
    }

    /// Record a failure for a resource that never reached a worker.
    fn fail_unstarted(
        &self,
        run: &mut Run,
        resource: &Resource,
        reason: FailureReason,
    ) -> Result<()> {
        self.sessions.record_result(
            &mut run.session,
            WorkResult {
                resource_id: resource.id.clone(),
                status: WorkStatus::Failed,
                stages: Vec::new(),
                findings: Vec::new(),
                cost: 0,
                overrun: 0,
                failure: Some(reason),
                recorded_at: self.clock.now(),
            },
        )?;
        run.states.set(&resource.id, ResourceState::Failed);
        run.since_checkpoint += 1;
        Ok(())
    }

    fn checkpoint(&self, run: &mut Run, ledger: &BudgetLedger) -> Result<()> {
        let snapshot = ProgressSnapshot {
            states: run.states.clone(),
            completed_items: run.session.completed_items,
            failed_items: run.session.failed_items,
            budget: ledger.snapshot()?,
        };
        self.sessions.checkpoint(&run.session, snapshot)?;
        run.since_checkpoint = 0;
        run.last_checkpoint = Instant::now();
        Ok(())
    }
}
