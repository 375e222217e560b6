//! Domain types shared by every crate: resources, runtime state, results, sessions.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tier::RiskTier;

/// Identifier of a unit of work: the file path relative to the target root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A file tracked by the scheduler, with the risk fields owned by the risk graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub path: PathBuf,
    pub risk: f64,
    pub tier: RiskTier,
    pub wave: usize,
    pub dependents: Vec<ResourceId>,
    pub complexity: f64,
    pub criticality: f64,
}

/// Runtime state of a resource within a session. Owned by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Pending,
    Locked,
    InProgress,
    Completed,
    Failed,
    /// Lock was busy; retried after a backoff.
    Deferred,
}

impl ResourceState {
    /// Not yet resolved: still counts against wave drainage.
    pub fn is_outstanding(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Deferred | Self::Locked | Self::InProgress
        )
    }

    /// Held by a worker right now.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Locked | Self::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Locked => "locked",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Deferred => "deferred",
        }
    }
}

/// Runtime state of every resource in a session, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceStates(BTreeMap<ResourceId, ResourceState>);

impl ResourceStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every id starts out pending.
    pub fn pending<'a>(ids: impl IntoIterator<Item = &'a ResourceId>) -> Self {
        Self(
            ids.into_iter()
                .map(|id| (id.clone(), ResourceState::Pending))
                .collect(),
        )
    }

    /// Unknown ids read as pending.
    pub fn get(&self, id: &ResourceId) -> ResourceState {
        self.0.get(id).copied().unwrap_or(ResourceState::Pending)
    }

    pub fn set(&mut self, id: &ResourceId, state: ResourceState) {
        self.0.insert(id.clone(), state);
    }

    pub fn count(&self, state: ResourceState) -> usize {
        self.0.values().filter(|s| **s == state).count()
    }

    pub fn any_outstanding(&self) -> bool {
        self.0.values().any(|s| s.is_outstanding())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceId, ResourceState)> {
        self.0.iter().map(|(id, s)| (id, *s))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deferred resources become pending again after a busy backoff.
    pub fn undefer_all(&mut self) -> usize {
        let mut count = 0;
        for state in self.0.values_mut() {
            if *state == ResourceState::Deferred {
                *state = ResourceState::Pending;
                count += 1;
            }
        }
        count
    }
}

/// Outcome reported by a single pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum StageOutcome {
    Ok,
    /// Recorded but non-fatal; the pipeline continues.
    SoftFailure(String),
    /// Short-circuits the pipeline and triggers rollback.
    HardFailure(String),
}

/// Something a stage noticed about a resource. Opaque to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub stage: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Per-stage record inside a work result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    pub outcome: StageOutcome,
    pub cost: u64,
    pub modified: bool,
    pub duration_ms: u64,
}

/// Why a resource did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    StageTimeout { stage: String },
    StageHardFailure { stage: String, message: String },
    PermanentlyOversized { estimate: u64, limit: u64 },
    LockLost,
    Cancelled,
    /// Rolling back after `after` failed, so modified content may still be in place.
    /// The backup is kept for the next resume.
    RestoreFailed { after: String, message: String },
    Internal { message: String },
}

impl FailureReason {
    /// The resource may hold half-applied content.
    pub fn needs_repair(&self) -> bool {
        matches!(self, Self::RestoreFailed { .. })
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StageTimeout { stage } => write!(f, "stage '{stage}' timed out"),
            Self::StageHardFailure { stage, message } => {
                write!(f, "stage '{stage}' failed: {message}")
            }
            Self::PermanentlyOversized { estimate, limit } => {
                write!(f, "estimated cost {estimate} exceeds window limit {limit}")
            }
            Self::LockLost => write!(f, "lock lost to another holder"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::RestoreFailed { after, message } => {
                write!(f, "rollback after {after} failed: {message}")
            }
            Self::Internal { message } => write!(f, "internal: {message}"),
        }
    }
}

/// Final status of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Completed,
    Failed,
    /// Reverted to its backup because the session was cancelled mid-pipeline.
    RolledBack,
}

impl WorkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl std::str::FromStr for WorkStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(crate::Error::Database(format!("unknown work status: {other}"))),
        }
    }
}

/// Immutable record of processing one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    pub resource_id: ResourceId,
    pub status: WorkStatus,
    pub stages: Vec<StageRecord>,
    pub findings: Vec<Finding>,
    /// Cost actually charged to the budget.
    pub cost: u64,
    /// Cost the work consumed beyond what the budget could absorb.
    #[serde(default)]
    pub overrun: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub recorded_at: DateTime<Utc>,
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "aborted" => Ok(Self::Aborted),
            other => Err(crate::Error::Database(format!("unknown session status: {other}"))),
        }
    }
}

/// What a session was started against, kept so `resume` can rebuild the risk graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outstanding_states() {
        assert!(ResourceState::Pending.is_outstanding());
        assert!(ResourceState::Deferred.is_outstanding());
        assert!(ResourceState::InProgress.is_outstanding());
        assert!(!ResourceState::Completed.is_outstanding());
        assert!(!ResourceState::Failed.is_outstanding());
    }

    #[test]
    fn test_resource_states_undefer() {
        let a = ResourceId::from("a.rs");
        let b = ResourceId::from("b.rs");
        let mut states = ResourceStates::pending([&a, &b]);
        states.set(&a, ResourceState::Deferred);
        assert_eq!(states.count(ResourceState::Deferred), 1);
        assert_eq!(states.undefer_all(), 1);
        assert_eq!(states.get(&a), ResourceState::Pending);
        assert_eq!(states.get(&ResourceId::from("missing.rs")), ResourceState::Pending);
    }

    #[test]
    fn test_stage_outcome_serialization() {
        let json = serde_json::to_value(StageOutcome::HardFailure("bad".into())).unwrap();
        assert_eq!(json["outcome"], "hard_failure");
        assert_eq!(json["message"], "bad");
        let ok = serde_json::to_value(StageOutcome::Ok).unwrap();
        assert_eq!(ok["outcome"], "ok");
    }

    #[test]
    fn test_session_status_terminal() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Aborted.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
        assert_eq!("paused".parse::<SessionStatus>().unwrap(), SessionStatus::Paused);
    }
}
