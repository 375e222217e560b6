//! SQLite-backed durable store.
//!
//! Every multi-row change (lock grant + backup + recovery event, session + items,
//! checkpoint) commits in a single `BEGIN IMMEDIATE` transaction, so a crash leaves
//! either the whole change or none of it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use crate::schema::{COORDINATION_SCHEMA_SQL, SESSION_SCHEMA_SQL};
use crate::types::*;
use shepherd_core::clock::{from_millis, to_millis};
use shepherd_core::config::WindowKind;
use shepherd_core::{Error, ResourceId, Result, WorkResult};

/// SQLite store for sessions, checkpoints, locks, backups and budget windows.
pub struct SqliteStore {
    pub(crate) conn: Mutex<Connection>,
    db_path: PathBuf,
}

fn db(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn to_usize(v: i64) -> usize {
    usize::try_from(v).unwrap_or(0)
}

/// Parse a text column into a domain enum, surfacing failures as conversion errors.
fn parse_text<T>(row: &Row<'_>, col: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = Error>,
{
    let raw: String = row.get(col)?;
    raw.parse().map_err(|e: Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn write_budget_windows(conn: &Connection, windows: &[BudgetWindowRecord]) -> Result<()> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO budget_windows (scope, kind, limit_units, consumed, window_start, \
             window_end, epoch) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(scope, kind) DO UPDATE SET limit_units = excluded.limit_units, \
             consumed = excluded.consumed, window_start = excluded.window_start, \
             window_end = excluded.window_end, epoch = excluded.epoch",
        )
        .map_err(db)?;
    for w in windows {
        stmt.execute(params![
            w.scope,
            w.kind.key(),
            to_i64(w.limit),
            to_i64(w.consumed),
            to_millis(w.window_start),
            w.window_end.map(to_millis),
            to_i64(w.epoch),
        ])
        .map_err(db)?;
    }
    Ok(())
}

fn read_budget_windows(conn: &Connection, scopes: &[&str]) -> Result<Vec<BudgetWindowRecord>> {
    let mut stmt = conn
        .prepare_cached("SELECT * FROM budget_windows WHERE scope = ?1 ORDER BY kind")
        .map_err(db)?;
    let mut windows = Vec::new();
    for scope in scopes {
        let rows = stmt
            .query_map(params![scope], |row| {
                let key: String = row.get("kind")?;
                Ok((
                    key,
                    BudgetWindowRecord {
                        scope: row.get("scope")?,
                        kind: WindowKind::Session,
                        limit: to_u64(row.get("limit_units")?),
                        consumed: to_u64(row.get("consumed")?),
                        window_start: from_millis(row.get("window_start")?),
                        window_end: row.get::<_, Option<i64>>("window_end")?.map(from_millis),
                        epoch: to_u64(row.get("epoch")?),
                    },
                ))
            })
            .map_err(db)?;
        for row in rows {
            let (key, mut record) = row.map_err(db)?;
            match WindowKind::from_key(&key) {
                Some(kind) => {
                    record.kind = kind;
                    windows.push(record);
                }
                None => debug!("Skipping budget window with unknown kind '{}'", key),
            }
        }
    }
    Ok(windows)
}

impl SqliteStore {
    /// Open or create the store at `db_file`.
    pub fn open(db_file: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_file.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Storage(e.to_string()))?;
        }

        let conn = Self::create_connection(&db_path)?;
        Self::init_schema(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };

        let stats = store.get_stats()?;
        info!(
            "SqliteStore initialized: {} sessions, {} live locks, path={}",
            stats.sessions,
            stats.live_locks,
            store.db_path.display()
        );

        Ok(store)
    }

    /// Private in-memory store, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(db)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(db)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = FULL;",
        )
        .map_err(db)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let full_schema = format!("{}\n{}", SESSION_SCHEMA_SQL, COORDINATION_SCHEMA_SQL);
        conn.execute_batch(&full_schema)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ---------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------

    /// Insert a session and its items in one transaction.
    pub fn insert_session(&self, session: &SessionRecord, items: &[SessionItem]) -> Result<()> {
        let manifest_json = serde_json::to_string(&session.manifest)?;
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db)?;
        tx.execute(
            "INSERT INTO sessions (id, status, started_at, updated_at, total_items, \
             completed_items, failed_items, manifest_json, cancel_requested) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session.id,
                session.status.as_str(),
                to_millis(session.started_at),
                to_millis(session.updated_at),
                session.total_items as i64,
                session.completed_items as i64,
                session.failed_items as i64,
                manifest_json,
                session.cancel_requested,
            ],
        )
        .map_err(db)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO session_items (session_id, resource_id, path, tier, wave, risk) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .map_err(db)?;
            for item in items {
                stmt.execute(params![
                    session.id,
                    item.resource_id.as_str(),
                    item.path,
                    item.tier.to_string(),
                    item.wave as i64,
                    item.risk,
                ])
                .map_err(db)?;
            }
        }
        tx.commit().map_err(db)?;
        debug!("Inserted session {} with {} items", session.id, items.len());
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .prepare_cached("SELECT * FROM sessions WHERE id = ?1")
            .map_err(db)?
            .query_row(params![session_id], Self::row_to_session)
            .optional()
            .map_err(db)?;
        Ok(row)
    }

    /// All sessions, newest first.
    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM sessions ORDER BY started_at DESC")
            .map_err(db)?;
        let rows = stmt.query_map([], Self::row_to_session).map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    /// Update status and counters. Returns false if the session does not exist.
    pub fn update_session(
        &self,
        session_id: &str,
        status: shepherd_core::SessionStatus,
        completed_items: usize,
        failed_items: usize,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE sessions SET status = ?1, completed_items = ?2, failed_items = ?3, \
                 updated_at = ?4 WHERE id = ?5",
                params![
                    status.as_str(),
                    completed_items as i64,
                    failed_items as i64,
                    to_millis(updated_at),
                    session_id
                ],
            )
            .map_err(db)?;
        Ok(count > 0)
    }

    pub fn set_cancel_requested(&self, session_id: &str, requested: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE sessions SET cancel_requested = ?1 WHERE id = ?2",
                params![requested, session_id],
            )
            .map_err(db)?;
        Ok(count > 0)
    }

    pub fn cancel_requested(&self, session_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let flag: Option<bool> = conn
            .prepare_cached("SELECT cancel_requested FROM sessions WHERE id = ?1")
            .map_err(db)?
            .query_row(params![session_id], |row| row.get(0))
            .optional()
            .map_err(db)?;
        Ok(flag.unwrap_or(false))
    }

    pub fn session_items(&self, session_id: &str) -> Result<Vec<SessionItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM session_items WHERE session_id = ?1 ORDER BY wave, resource_id",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok(SessionItem {
                    resource_id: ResourceId(row.get("resource_id")?),
                    path: row.get("path")?,
                    tier: parse_text(row, "tier")?,
                    wave: to_usize(row.get("wave")?),
                    risk: row.get("risk")?,
                })
            })
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
        let manifest_json: String = row.get("manifest_json")?;
        let manifest = serde_json::from_str(&manifest_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(SessionRecord {
            id: row.get("id")?,
            status: parse_text(row, "status")?,
            started_at: from_millis(row.get("started_at")?),
            updated_at: from_millis(row.get("updated_at")?),
            total_items: to_usize(row.get("total_items")?),
            completed_items: to_usize(row.get("completed_items")?),
            failed_items: to_usize(row.get("failed_items")?),
            manifest,
            cancel_requested: row.get("cancel_requested")?,
        })
    }

    // ---------------------------------------------------------------
    // Work results (append-only)
    // ---------------------------------------------------------------

    pub fn insert_work_result(&self, session_id: &str, result: &WorkResult) -> Result<i64> {
        let json = serde_json::to_string(result)?;
        let conn = self.conn.lock();
        let id = conn
            .prepare_cached(
                "INSERT INTO work_results (session_id, resource_id, status, cost, overrun, \
                 result_json, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .map_err(db)?
            .insert(params![
                session_id,
                result.resource_id.as_str(),
                result.status.as_str(),
                to_i64(result.cost),
                to_i64(result.overrun),
                json,
                to_millis(result.recorded_at),
            ])
            .map_err(db)?;
        Ok(id)
    }

    /// Every result recorded for a session, in recording order.
    pub fn work_results(&self, session_id: &str) -> Result<Vec<WorkResult>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT result_json FROM work_results WHERE session_id = ?1 ORDER BY id")
            .map_err(db)?;
        let rows = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))
            .map_err(db)?;
        let mut results = Vec::new();
        for raw in rows {
            let raw = raw.map_err(db)?;
            results.push(serde_json::from_str(&raw)?);
        }
        Ok(results)
    }

    /// Sum of the cost charged by every result of a session.
    pub fn total_cost(&self, session_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let total: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(cost), 0) FROM work_results WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .map_err(db)?;
        Ok(to_u64(total))
    }

    // ---------------------------------------------------------------
    // Checkpoints (append-only)
    // ---------------------------------------------------------------

    pub fn insert_checkpoint(
        &self,
        session_id: &str,
        snapshot_json: &str,
        checksum: &str,
        created_at: DateTime<Utc>,
    ) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db)?;
        tx.execute(
            "INSERT INTO checkpoints (session_id, snapshot_json, checksum, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, snapshot_json, checksum, to_millis(created_at)],
        )
        .map_err(db)?;
        let seq = tx.last_insert_rowid();
        tx.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![to_millis(created_at), session_id],
        )
        .map_err(db)?;
        tx.commit().map_err(db)?;
        Ok(seq)
    }

    pub fn latest_checkpoint(&self, session_id: &str) -> Result<Option<CheckpointRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .prepare_cached(
                "SELECT * FROM checkpoints WHERE session_id = ?1 ORDER BY seq DESC LIMIT 1",
            )
            .map_err(db)?
            .query_row(params![session_id], |row| {
                Ok(CheckpointRecord {
                    seq: row.get("seq")?,
                    session_id: row.get("session_id")?,
                    snapshot_json: row.get("snapshot_json")?,
                    checksum: row.get("checksum")?,
                    created_at: from_millis(row.get("created_at")?),
                })
            })
            .optional()
            .map_err(db)?;
        Ok(row)
    }

    pub fn count_checkpoints(&self, session_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM checkpoints WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .map_err(db)
    }

    // ---------------------------------------------------------------
    // Locks and backups
    // ---------------------------------------------------------------

    /// Atomically grant `candidate` unless a live lock exists on the resource.
    ///
    /// An expired lock is reclaimed and a recovery event recorded. The first grant
    /// of a resource within a session stores the output of `snapshot` as its backup,
    /// in the same transaction as the grant.
    pub fn try_acquire_lock<F>(
        &self,
        candidate: &Lock,
        now: DateTime<Utc>,
        snapshot: F,
    ) -> Result<LockAttempt>
    where
        F: FnOnce() -> Result<Option<Vec<u8>>>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db)?;

        let existing = tx
            .prepare_cached("SELECT * FROM locks WHERE resource_id = ?1")
            .map_err(db)?
            .query_row(params![candidate.resource_id.as_str()], Self::row_to_lock)
            .optional()
            .map_err(db)?;

        let reclaimed = match existing {
            Some(lock) if !lock.is_expired(now) => return Ok(LockAttempt::Busy(lock)),
            Some(lock) => {
                Self::insert_recovery_event_in(
                    &tx,
                    &RecoveryEvent {
                        session_id: candidate.session_id.clone(),
                        resource_id: candidate.resource_id.clone(),
                        kind: RecoveryKind::StaleLockReclaimed,
                        previous_holder: Some(lock.holder_id.clone()),
                        detail: format!(
                            "lock held by {} expired at {}; reclaimed by {}",
                            lock.holder_id,
                            lock.expires_at.to_rfc3339(),
                            candidate.holder_id
                        ),
                        occurred_at: now,
                    },
                )?;
                Some(lock)
            }
            None => None,
        };

        tx.execute(
            "INSERT INTO locks (resource_id, holder_id, token, session_id, acquired_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(resource_id) DO UPDATE SET holder_id = excluded.holder_id, \
             token = excluded.token, session_id = excluded.session_id, \
             acquired_at = excluded.acquired_at, expires_at = excluded.expires_at",
            params![
                candidate.resource_id.as_str(),
                candidate.holder_id,
                candidate.token,
                candidate.session_id,
                to_millis(candidate.acquired_at),
                to_millis(candidate.expires_at),
            ],
        )
        .map_err(db)?;

        let has_backup: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM backups WHERE session_id = ?1 AND resource_id = ?2)",
                params![candidate.session_id, candidate.resource_id.as_str()],
                |row| row.get(0),
            )
            .map_err(db)?;

        let backup_taken = if has_backup {
            false
        } else {
            let content = snapshot()?;
            tx.execute(
                "INSERT INTO backups (session_id, resource_id, acquired_at, existed, content) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    candidate.session_id,
                    candidate.resource_id.as_str(),
                    to_millis(candidate.acquired_at),
                    content.is_some(),
                    content,
                ],
            )
            .map_err(db)?;
            true
        };

        tx.commit().map_err(db)?;
        Ok(LockAttempt::Granted {
            lock: candidate.clone(),
            reclaimed,
            backup_taken,
        })
    }

    /// Extend a lock. Returns false if the lock is no longer held under this token.
    pub fn renew_lock(&self, lock: &Lock, expires_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE locks SET expires_at = ?1 WHERE resource_id = ?2 AND token = ?3",
                params![to_millis(expires_at), lock.resource_id.as_str(), lock.token],
            )
            .map_err(db)?;
        Ok(count > 0)
    }

    /// Delete a lock if still held under its token. Idempotent.
    pub fn release_lock(&self, lock: &Lock) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "DELETE FROM locks WHERE resource_id = ?1 AND token = ?2",
                params![lock.resource_id.as_str(), lock.token],
            )
            .map_err(db)?;
        Ok(count > 0)
    }

    pub fn get_lock(&self, resource_id: &ResourceId) -> Result<Option<Lock>> {
        let conn = self.conn.lock();
        let row = conn
            .prepare_cached("SELECT * FROM locks WHERE resource_id = ?1")
            .map_err(db)?
            .query_row(params![resource_id.as_str()], Self::row_to_lock)
            .optional()
            .map_err(db)?;
        Ok(row)
    }

    /// Locks whose ttl has not elapsed at `now`.
    pub fn live_locks(&self, now: DateTime<Utc>) -> Result<Vec<Lock>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM locks WHERE expires_at > ?1 ORDER BY resource_id")
            .map_err(db)?;
        let rows = stmt
            .query_map(params![to_millis(now)], Self::row_to_lock)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    /// Every lock row (live or expired) recorded under a session.
    pub fn locks_for_session(&self, session_id: &str) -> Result<Vec<Lock>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM locks WHERE session_id = ?1 ORDER BY resource_id")
            .map_err(db)?;
        let rows = stmt
            .query_map(params![session_id], Self::row_to_lock)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn row_to_lock(row: &Row<'_>) -> rusqlite::Result<Lock> {
        Ok(Lock {
            resource_id: ResourceId(row.get("resource_id")?),
            holder_id: row.get("holder_id")?,
            token: row.get("token")?,
            session_id: row.get("session_id")?,
            acquired_at: from_millis(row.get("acquired_at")?),
            expires_at: from_millis(row.get("expires_at")?),
        })
    }

    pub fn get_backup(&self, session_id: &str, resource_id: &ResourceId) -> Result<Option<Backup>> {
        let conn = self.conn.lock();
        let row = conn
            .prepare_cached("SELECT * FROM backups WHERE session_id = ?1 AND resource_id = ?2")
            .map_err(db)?
            .query_row(params![session_id, resource_id.as_str()], |row| {
                let existed: bool = row.get("existed")?;
                let content: Option<Vec<u8>> = row.get("content")?;
                Ok(Backup {
                    session_id: row.get("session_id")?,
                    resource_id: ResourceId(row.get("resource_id")?),
                    acquired_at: from_millis(row.get("acquired_at")?),
                    content: if existed {
                        Some(content.unwrap_or_default())
                    } else {
                        None
                    },
                })
            })
            .optional()
            .map_err(db)?;
        Ok(row)
    }

    pub fn backed_up_resources(&self, session_id: &str) -> Result<Vec<ResourceId>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT resource_id FROM backups WHERE session_id = ?1 ORDER BY resource_id",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![session_id], |row| Ok(ResourceId(row.get(0)?)))
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    /// Drop the backups of a session whose locks have all been released.
    pub fn prune_backups(&self, session_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM backups WHERE session_id = ?1 AND resource_id NOT IN \
             (SELECT resource_id FROM locks WHERE session_id = ?1)",
            params![session_id],
        )
        .map_err(db)
    }

    // ---------------------------------------------------------------
    // Recovery events
    // ---------------------------------------------------------------

    pub fn insert_recovery_event(&self, event: &RecoveryEvent) -> Result<i64> {
        let conn = self.conn.lock();
        Self::insert_recovery_event_in(&conn, event)
    }

    fn insert_recovery_event_in(conn: &Connection, event: &RecoveryEvent) -> Result<i64> {
        conn.prepare_cached(
            "INSERT INTO recovery_events (session_id, resource_id, kind, previous_holder, \
             detail, occurred_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .map_err(db)?
        .insert(params![
            event.session_id,
            event.resource_id.as_str(),
            event.kind.as_str(),
            event.previous_holder,
            event.detail,
            to_millis(event.occurred_at),
        ])
        .map_err(db)
    }

    pub fn recovery_events(&self, session_id: &str) -> Result<Vec<RecoveryEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM recovery_events WHERE session_id = ?1 ORDER BY id")
            .map_err(db)?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                let kind: String = row.get("kind")?;
                Ok(RecoveryEvent {
                    session_id: row.get("session_id")?,
                    resource_id: ResourceId(row.get("resource_id")?),
                    kind: RecoveryKind::parse(&kind).unwrap_or(RecoveryKind::StaleLockReclaimed),
                    previous_holder: row.get("previous_holder")?,
                    detail: row.get("detail")?,
                    occurred_at: from_millis(row.get("occurred_at")?),
                })
            })
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    // ---------------------------------------------------------------
    // Budget windows
    // ---------------------------------------------------------------

    /// Persist a set of windows in one transaction.
    pub fn save_budget_windows(&self, windows: &[BudgetWindowRecord]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db)?;
        write_budget_windows(&tx, windows)?;
        tx.commit().map_err(db)
    }

    /// Windows stored under any of `scopes`.
    pub fn budget_windows(&self, scopes: &[&str]) -> Result<Vec<BudgetWindowRecord>> {
        let conn = self.conn.lock();
        read_budget_windows(&conn, scopes)
    }

    /// Read-modify-write of the windows under `scopes` in one `BEGIN IMMEDIATE`
    /// transaction. `update` sees the stored rows and returns the rows to write back
    /// along with its result. Every writer of a shared window goes through here, so
    /// concurrent ledgers (in this process or another) see each other's debits.
    pub fn update_budget_windows<T>(
        &self,
        scopes: &[&str],
        update: impl FnOnce(&[BudgetWindowRecord]) -> (Vec<BudgetWindowRecord>, T),
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db)?;
        let stored = read_budget_windows(&tx, scopes)?;
        let (windows, out) = update(&stored);
        write_budget_windows(&tx, &windows)?;
        tx.commit().map_err(db)?;
        Ok(out)
    }

    // ---------------------------------------------------------------
    // Stats
    // ---------------------------------------------------------------

    pub fn get_stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();
        let count = |sql: &str| -> Result<i64> { conn.query_row(sql, [], |row| row.get(0)).map_err(db) };
        let now = to_millis(Utc::now());
        let live_locks: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM locks WHERE expires_at > ?1",
                params![now],
                |row| row.get(0),
            )
            .map_err(db)?;
        Ok(StoreStats {
            sessions: count("SELECT COUNT(*) FROM sessions")?,
            live_locks,
            backups: count("SELECT COUNT(*) FROM backups")?,
            work_results: count("SELECT COUNT(*) FROM work_results")?,
            checkpoints: count("SELECT COUNT(*) FROM checkpoints")?,
            db_path: self.db_path.display().to_string(),
        })
    }
}
