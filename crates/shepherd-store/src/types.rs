//! Row types for sessions, locks, backups, budget windows and recovery events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shepherd_core::config::WindowKind;
use shepherd_core::{ResourceId, RiskTier, SessionManifest, SessionStatus};

/// A session row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    pub manifest: SessionManifest,
    pub cancel_requested: bool,
}

/// A resource registered with a session at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionItem {
    pub resource_id: ResourceId,
    pub path: String,
    pub tier: RiskTier,
    pub wave: usize,
    pub risk: f64,
}

/// A checkpoint row as written; the snapshot is still serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub seq: i64,
    pub session_id: String,
    pub snapshot_json: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Exclusive, time-bounded ownership of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub resource_id: ResourceId,
    pub holder_id: String,
    /// Distinguishes successive grants to the same holder.
    pub token: String,
    pub session_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of an atomic lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Granted {
        lock: Lock,
        /// The expired lock that was forcibly reclaimed, if any.
        reclaimed: Option<Lock>,
        /// Whether this grant recorded the session's backup of the resource.
        backup_taken: bool,
    },
    Busy(Lock),
}

/// Pre-modification content of a resource, taken with its first lock in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub session_id: String,
    pub resource_id: ResourceId,
    pub acquired_at: DateTime<Utc>,
    /// `None` when the file did not exist at acquisition time.
    pub content: Option<Vec<u8>>,
}

/// Persisted state of one budget window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetWindowRecord {
    /// `global` for shared windows, the session id for session windows.
    pub scope: String,
    pub kind: WindowKind,
    pub limit: u64,
    pub consumed: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: Option<DateTime<Utc>>,
    /// Incremented on every reset so settlements never touch a newer window.
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    /// An expired lock was forcibly taken over by a new acquirer.
    StaleLockReclaimed,
    /// A resource left mid-modification by a crash was restored on resume.
    CrashRestore,
}

impl RecoveryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StaleLockReclaimed => "stale_lock_reclaimed",
            Self::CrashRestore => "crash_restore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stale_lock_reclaimed" => Some(Self::StaleLockReclaimed),
            "crash_restore" => Some(Self::CrashRestore),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub session_id: String,
    pub resource_id: ResourceId,
    pub kind: RecoveryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_holder: Option<String>,
    pub detail: String,
    pub occurred_at: DateTime<Utc>,
}

/// Store-level statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub sessions: i64,
    pub live_locks: i64,
    pub backups: i64,
    pub work_results: i64,
    pub checkpoints: i64,
    pub db_path: String,
}
