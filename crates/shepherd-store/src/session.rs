//! Session lifecycle: create, record results, checkpoint, resume, finalize.
//!
//! Checkpoints are committed in one SQLite transaction and carry a sha256 checksum
//! over the session id and serialized snapshot. `resume` only ever returns the latest
//! committed checkpoint and refuses one whose checksum does not match.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::analytics::AnalyticsLog;
use crate::sqlite::SqliteStore;
use crate::types::{BudgetWindowRecord, CheckpointRecord, SessionItem, SessionRecord};
use shepherd_core::{
    Clock, Error, ResourceId, ResourceState, ResourceStates, Result, SessionManifest,
    SessionStatus, WorkResult, WorkStatus,
};

/// In-memory view of a session, mutated by the orchestrator after every item.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    /// Latest result per resource.
    pub outcomes: BTreeMap<ResourceId, WorkResult>,
    pub manifest: SessionManifest,
}

impl Session {
    fn from_record(record: SessionRecord, results: Vec<WorkResult>) -> Self {
        let mut session = Self {
            id: record.id,
            status: record.status,
            started_at: record.started_at,
            total_items: record.total_items,
            completed_items: 0,
            failed_items: 0,
            outcomes: BTreeMap::new(),
            manifest: record.manifest,
        };
        for result in results {
            session.outcomes.insert(result.resource_id.clone(), result);
        }
        session.recount();
        session
    }

    fn recount(&mut self) {
        self.completed_items = self.count(WorkStatus::Completed);
        self.failed_items = self.count(WorkStatus::Failed);
    }

    fn count(&self, status: WorkStatus) -> usize {
        self.outcomes.values().filter(|r| r.status == status).count()
    }

    pub fn is_completed(&self, resource_id: &ResourceId) -> bool {
        self.outcomes
            .get(resource_id)
            .is_some_and(|r| r.status == WorkStatus::Completed)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::SessionClosed(format!(
                "session {} is {}",
                self.id, self.status
            )));
        }
        Ok(())
    }
}

/// Progress captured by a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub states: ResourceStates,
    pub completed_items: usize,
    pub failed_items: usize,
    #[serde(default)]
    pub budget: Vec<BudgetWindowRecord>,
}

/// A verified checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub seq: i64,
    pub session_id: String,
    pub snapshot: ProgressSnapshot,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

fn checksum(session_id: &str, snapshot_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(snapshot_json.as_bytes());
    hex::encode(hasher.finalize())
}

/// Durable record of runs. Writes are serialized through the store's connection.
pub struct SessionStore {
    store: Arc<SqliteStore>,
    analytics: Option<AnalyticsLog>,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(store: Arc<SqliteStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            analytics: None,
            clock,
        }
    }

    /// Also append every recorded result to a JSONL analytics log.
    pub fn with_analytics(mut self, log: AnalyticsLog) -> Self {
        self.analytics = Some(log);
        self
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Start a new session over `items`.
    pub fn create(&self, manifest: SessionManifest, items: &[SessionItem]) -> Result<Session> {
        let now = self.clock.now();
        let record = SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            status: SessionStatus::Active,
            started_at: now,
            updated_at: now,
            total_items: items.len(),
            completed_items: 0,
            failed_items: 0,
            manifest,
            cancel_requested: false,
        };
        self.store.insert_session(&record, items)?;
        info!(
            "Created session {} with {} items (root={})",
            record.id,
            record.total_items,
            record.manifest.root.display()
        );
        Ok(Session::from_record(record, Vec::new()))
    }

    /// Append a result to the session and the analytics log.
    pub fn record_result(&self, session: &mut Session, result: WorkResult) -> Result<()> {
        session.ensure_open()?;
        self.store.insert_work_result(&session.id, &result)?;
        if let Some(log) = &self.analytics {
            if let Err(e) = log.append(&session.id, &result) {
                warn!("Failed to append analytics for {}: {}", result.resource_id, e);
            }
        }
        session.outcomes.insert(result.resource_id.clone(), result);
        session.recount();
        self.store.update_session(
            &session.id,
            session.status,
            session.completed_items,
            session.failed_items,
            self.clock.now(),
        )?;
        Ok(())
    }

    /// Commit a checkpoint of `snapshot`.
    pub fn checkpoint(&self, session: &Session, snapshot: ProgressSnapshot) -> Result<Checkpoint> {
        session.ensure_open()?;
        let snapshot_json = serde_json::to_string(&snapshot)?;
        let checksum = checksum(&session.id, &snapshot_json);
        let created_at = self.clock.now();
        let seq = self
            .store
            .insert_checkpoint(&session.id, &snapshot_json, &checksum, created_at)?;
        debug!(
            "Checkpoint {} for session {}: {} completed, {} failed",
            seq, session.id, snapshot.completed_items, snapshot.failed_items
        );
        Ok(Checkpoint {
            seq,
            session_id: session.id.clone(),
            snapshot,
            checksum,
            created_at,
        })
    }

    /// Latest checkpoint of a session, verified against its checksum.
    pub fn latest_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        match self.store.latest_checkpoint(session_id)? {
            Some(record) => Self::verify(record).map(Some),
            None => Ok(None),
        }
    }

    fn verify(record: CheckpointRecord) -> Result<Checkpoint> {
        let expected = checksum(&record.session_id, &record.snapshot_json);
        if expected != record.checksum {
            return Err(Error::CheckpointCorruption {
                session_id: record.session_id,
                reason: format!("checksum mismatch on checkpoint {}", record.seq),
            });
        }
        let snapshot = serde_json::from_str(&record.snapshot_json).map_err(|e| {
            Error::CheckpointCorruption {
                session_id: record.session_id.clone(),
                reason: format!("checkpoint {} does not parse: {}", record.seq, e),
            }
        })?;
        Ok(Checkpoint {
            seq: record.seq,
            session_id: record.session_id,
            snapshot,
            checksum: record.checksum,
            created_at: record.created_at,
        })
    }

    /// Read-only view of a session, for reporting.
    pub fn load(&self, session_id: &str) -> Result<Session> {
        let record = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        let results = self.store.work_results(session_id)?;
        Ok(Session::from_record(record, results))
    }

    /// Reopen a non-terminal session. Results recorded after the last checkpoint are
    /// included in the returned session's outcomes.
    pub fn resume(&self, session_id: &str) -> Result<(Session, Option<Checkpoint>)> {
        let mut session = self.load(session_id)?;
        session.ensure_open()?;
        let checkpoint = self.latest_checkpoint(session_id)?;
        if let Some(checkpoint) = &checkpoint {
            Self::check_against_results(&session, checkpoint)?;
        }

        session.status = SessionStatus::Active;
        self.store.set_cancel_requested(session_id, false)?;
        self.store.update_session(
            session_id,
            session.status,
            session.completed_items,
            session.failed_items,
            self.clock.now(),
        )?;
        info!(
            "Resumed session {}: {}/{} completed, checkpoint={:?}",
            session_id,
            session.completed_items,
            session.total_items,
            checkpoint.as_ref().map(|c| c.seq)
        );
        Ok((session, checkpoint))
    }

    /// Results are committed before the checkpoint that counts them, so the result log
    /// always covers the latest checkpoint. A checkpoint claiming completions the log
    /// lacks was not written by this session's driver.
    fn check_against_results(session: &Session, checkpoint: &Checkpoint) -> Result<()> {
        let snapshot = &checkpoint.snapshot;
        let missing = snapshot
            .states
            .iter()
            .find(|(id, state)| *state == ResourceState::Completed && !session.is_completed(id));
        if let Some((id, _)) = missing {
            return Err(Error::CheckpointCorruption {
                session_id: session.id.clone(),
                reason: format!(
                    "checkpoint {} marks {} completed without a recorded result",
                    checkpoint.seq, id
                ),
            });
        }
        if snapshot.completed_items > session.completed_items {
            return Err(Error::CheckpointCorruption {
                session_id: session.id.clone(),
                reason: format!(
                    "checkpoint {} counts {} completed, results show {}",
                    checkpoint.seq, snapshot.completed_items, session.completed_items
                ),
            });
        }
        Ok(())
    }

    /// Mark a session paused: not terminal, resumable later.
    pub fn pause(&self, session: &mut Session) -> Result<()> {
        session.ensure_open()?;
        session.status = SessionStatus::Paused;
        self.store.update_session(
            &session.id,
            session.status,
            session.completed_items,
            session.failed_items,
            self.clock.now(),
        )?;
        info!("Session {} paused", session.id);
        Ok(())
    }

    /// Move a session to a terminal status. Completed sessions drop their backups.
    pub fn finalize(&self, session: &mut Session, status: SessionStatus) -> Result<()> {
        session.ensure_open()?;
        if !status.is_terminal() {
            return Err(Error::Internal(format!(
                "finalize requires a terminal status, got {status}"
            )));
        }
        session.status = status;
        self.store.update_session(
            &session.id,
            status,
            session.completed_items,
            session.failed_items,
            self.clock.now(),
        )?;
        if status == SessionStatus::Completed {
            let pruned = self.store.prune_backups(&session.id)?;
            debug!("Pruned {} backups of session {}", pruned, session.id);
        }
        info!(
            "Session {} finalized as {}: {} completed, {} failed of {}",
            session.id, status, session.completed_items, session.failed_items, session.total_items
        );
        Ok(())
    }

    /// Ask a session to stop. Active sessions are cancelled cooperatively by their
    /// driver; paused sessions have no driver and are aborted here.
    pub fn request_cancel(&self, session_id: &str) -> Result<SessionStatus> {
        let mut session = self.load(session_id)?;
        session.ensure_open()?;
        match session.status {
            SessionStatus::Paused => {
                self.finalize(&mut session, SessionStatus::Aborted)?;
                Ok(SessionStatus::Aborted)
            }
            _ => {
                self.store.set_cancel_requested(session_id, true)?;
                info!("Cancellation requested for session {}", session_id);
                Ok(session.status)
            }
        }
    }

    pub fn cancel_requested(&self, session_id: &str) -> Result<bool> {
        self.store.cancel_requested(session_id)
    }
}
