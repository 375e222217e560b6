//! Exclusive, time-bounded ownership of resources.
//!
//! Grants go through a single store transaction, so two acquirers can never both
//! hold a live lock on one resource. The first grant of a resource within a session
//! also records its backup, which `restore` writes back on rollback.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::workspace::Workspace;
use shepherd_core::{Clock, Error, ResourceId, Result};
use shepherd_store::{Lock, LockAttempt, RecoveryEvent, RecoveryKind, SqliteStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Granted(Lock),
    /// Another holder has a live lock. Not an error.
    Busy {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

pub struct LockTable {
    store: Arc<SqliteStore>,
    workspace: Arc<dyn Workspace>,
    clock: Arc<dyn Clock>,
    session_id: String,
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}

impl LockTable {
    pub fn new(
        store: Arc<SqliteStore>,
        workspace: Arc<dyn Workspace>,
        clock: Arc<dyn Clock>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            workspace,
            clock,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Take the lock on `resource` unless someone else holds a live one. An expired
    /// lock is reclaimed and the takeover recorded as a recovery event.
    pub fn acquire(&self, resource: &ResourceId, holder: &str, ttl: Duration) -> Result<Acquire> {
        let now = self.clock.now();
        let candidate = Lock {
            resource_id: resource.clone(),
            holder_id: holder.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
            acquired_at: now,
            expires_at: expiry(now, ttl),
        };
        let attempt = self
            .store
            .try_acquire_lock(&candidate, now, || self.workspace.read(resource))?;
        match attempt {
            LockAttempt::Busy(held) => {
                debug!(
                    "Lock on {} busy (held by {} until {})",
                    resource, held.holder_id, held.expires_at
                );
                Ok(Acquire::Busy {
                    holder: held.holder_id,
                    expires_at: held.expires_at,
                })
            }
            LockAttempt::Granted {
                lock,
                reclaimed,
                backup_taken,
            } => {
                if let Some(stale) = reclaimed {
                    warn!(
                        "Reclaimed stale lock on {} from {} (expired {})",
                        resource, stale.holder_id, stale.expires_at
                    );
                }
                debug!(
                    "Lock on {} granted to {} (backup taken: {})",
                    resource, holder, backup_taken
                );
                Ok(Acquire::Granted(lock))
            }
        }
    }

    /// Extend a held lock. Fails with `LockLost` if it was reclaimed meanwhile.
    pub fn renew(&self, lock: &mut Lock, ttl: Duration) -> Result<()> {
        let expires_at = expiry(self.clock.now(), ttl);
        if !self.store.renew_lock(lock, expires_at)? {
            return Err(Error::LockLost(lock.resource_id.to_string()));
        }
        lock.expires_at = expires_at;
        Ok(())
    }

    /// Drop a lock. Releasing a lock that is already gone is a no-op.
    pub fn release(&self, lock: &Lock) -> Result<bool> {
        let released = self.store.release_lock(lock)?;
        if !released {
            debug!("Lock on {} was already released", lock.resource_id);
        }
        Ok(released)
    }

    /// Write the session backup of `resource` back into the workspace. A resource
    /// that did not exist at acquisition is removed. Returns false without a backup.
    pub fn restore(&self, resource: &ResourceId) -> Result<bool> {
        let Some(backup) = self.store.get_backup(&self.session_id, resource)? else {
            return Ok(false);
        };
        match &backup.content {
            Some(content) => self.workspace.write(resource, content)?,
            None => self.workspace.remove(resource)?,
        }
        info!("Restored {} from backup taken at {}", resource, backup.acquired_at);
        Ok(true)
    }

    /// Restore a resource left mid-modification by a crashed run. Resources whose
    /// content already matches their backup are left alone and not reported.
    pub fn restore_after_crash(&self, resource: &ResourceId) -> Result<bool> {
        let Some(backup) = self.store.get_backup(&self.session_id, resource)? else {
            return Ok(false);
        };
        if self.workspace.read(resource)? == backup.content {
            return Ok(false);
        }
        self.restore(resource)?;
        self.store.insert_recovery_event(&RecoveryEvent {
            session_id: self.session_id.clone(),
            resource_id: resource.clone(),
            kind: RecoveryKind::CrashRestore,
            previous_holder: None,
            detail: "restored from backup on resume".into(),
            occurred_at: self.clock.now(),
        })?;
        Ok(true)
    }

    /// Resources of this session that have a backup.
    pub fn backed_up(&self) -> Result<Vec<ResourceId>> {
        self.store.backed_up_resources(&self.session_id)
    }

    /// Current live lock on `resource`, if any.
    pub fn holder_of(&self, resource: &ResourceId) -> Result<Option<Lock>> {
        let now = self.clock.now();
        Ok(self
            .store
            .get_lock(resource)?
            .filter(|lock| !lock.is_expired(now)))
    }

    pub fn live_locks(&self) -> Result<Vec<Lock>> {
        self.store.live_locks(self.clock.now())
    }

    pub fn recovery_events(&self) -> Result<Vec<RecoveryEvent>> {
        self.store.recovery_events(&self.session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::InMemoryWorkspace;
    use shepherd_core::ManualClock;

    struct Fixture {
        table: LockTable,
        clock: Arc<ManualClock>,
        workspace: Arc<InMemoryWorkspace>,
        store: Arc<SqliteStore>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::at_epoch());
        let workspace = Arc::new(InMemoryWorkspace::with_files([("a.rs", &b"original"[..])]));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let table = LockTable::new(store.clone(), workspace.clone(), clock.clone(), "s1");
        Fixture {
            table,
            clock,
            workspace,
            store,
        }
    }

    fn granted(acquire: Acquire) -> Lock {
        match acquire {
            Acquire::Granted(lock) => lock,
            other => panic!("expected grant, got {other:?}"),
        }
    }

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn test_mutual_exclusion_and_release() {
        let f = fixture();
        let a = ResourceId::from("a.rs");
        let lock = granted(f.table.acquire(&a, "w1", TTL).unwrap());
        assert!(matches!(
            f.table.acquire(&a, "w2", TTL).unwrap(),
            Acquire::Busy { ref holder, .. } if holder == "w1"
        ));
        assert_eq!(f.table.holder_of(&a).unwrap().unwrap().holder_id, "w1");

        assert!(f.table.release(&lock).unwrap());
        assert!(!f.table.release(&lock).unwrap());
        granted(f.table.acquire(&a, "w2", TTL).unwrap());
    }

    #[test]
    fn test_stale_lock_reclaimed_and_recorded() {
        let f = fixture();
        let a = ResourceId::from("a.rs");
        let mut stale = granted(f.table.acquire(&a, "crashed", TTL).unwrap());
        f.clock.advance(chrono::Duration::seconds(31));
        assert!(f.table.holder_of(&a).unwrap().is_none());

        let fresh = granted(f.table.acquire(&a, "w2", TTL).unwrap());
        let events = f.table.recovery_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, RecoveryKind::StaleLockReclaimed);
        assert_eq!(events[0].previous_holder.as_deref(), Some("crashed"));

        // The old holder can neither renew nor release the new lock.
        assert!(matches!(f.table.renew(&mut stale, TTL), Err(Error::LockLost(_))));
        assert!(!f.table.release(&stale).unwrap());
        assert_eq!(f.table.holder_of(&a).unwrap(), Some(fresh));
    }

    #[test]
    fn test_renew_extends_expiry() {
        let f = fixture();
        let a = ResourceId::from("a.rs");
        let mut lock = granted(f.table.acquire(&a, "w1", TTL).unwrap());
        f.clock.advance(chrono::Duration::seconds(20));
        f.table.renew(&mut lock, TTL).unwrap();
        f.clock.advance(chrono::Duration::seconds(20));
        assert!(matches!(f.table.acquire(&a, "w2", TTL).unwrap(), Acquire::Busy { .. }));
        assert_eq!(f.table.live_locks().unwrap().len(), 1);
    }

    #[test]
    fn test_restore_uses_first_backup() {
        let f = fixture();
        let a = ResourceId::from("a.rs");
        let lock = granted(f.table.acquire(&a, "w1", TTL).unwrap());
        f.workspace.write(&a, b"half-applied").unwrap();
        f.table.release(&lock).unwrap();

        // A second grant in the same session keeps the original backup.
        let lock = granted(f.table.acquire(&a, "w1", TTL).unwrap());
        assert!(f.table.restore(&a).unwrap());
        assert_eq!(f.workspace.get("a.rs"), Some(b"original".to_vec()));
        // Idempotent.
        assert!(f.table.restore(&a).unwrap());
        assert_eq!(f.workspace.get("a.rs"), Some(b"original".to_vec()));
        f.table.release(&lock).unwrap();
    }

    #[test]
    fn test_restore_removes_created_file() {
        let f = fixture();
        let new = ResourceId::from("new.rs");
        granted(f.table.acquire(&new, "w1", TTL).unwrap());
        f.workspace.write(&new, b"generated").unwrap();
        assert!(f.table.restore(&new).unwrap());
        assert_eq!(f.workspace.get("new.rs"), None);
        assert!(!f.table.restore(&ResourceId::from("never-locked.rs")).unwrap());
    }

    #[test]
    fn test_crash_restore_records_event() {
        let f = fixture();
        let a = ResourceId::from("a.rs");
        granted(f.table.acquire(&a, "w1", TTL).unwrap());
        f.workspace.write(&a, b"half-applied").unwrap();

        let resumed = LockTable::new(
            f.store.clone(),
            f.workspace.clone(),
            f.clock.clone(),
            "s1",
        );
        assert_eq!(resumed.backed_up().unwrap(), vec![a.clone()]);
        assert!(resumed.restore_after_crash(&a).unwrap());
        assert_eq!(f.workspace.get("a.rs"), Some(b"original".to_vec()));
        let events = resumed.recovery_events().unwrap();
        assert_eq!(events.last().unwrap().kind, RecoveryKind::CrashRestore);

        // Already intact: nothing to do, nothing recorded.
        assert!(!resumed.restore_after_crash(&a).unwrap());
        assert_eq!(resumed.recovery_events().unwrap().len(), events.len());
    }
}
