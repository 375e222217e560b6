//! Runtime types.

use serde::Serialize;

use shepherd_core::{FailureReason, ResourceId, SessionStatus, WorkStatus};
use shepherd_store::Session;

/// Final (or current) account of a session, printed by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub status: SessionStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    #[serde(rename = "rolledBack")]
    pub rolled_back: usize,
    pub pending: usize,
    /// Sum of cost the budget could not absorb.
    #[serde(rename = "overrunUnits")]
    pub overrun_units: u64,
    #[serde(rename = "recoveryEvents")]
    pub recovery_events: usize,
    pub failures: Vec<ResourceFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceFailure {
    pub resource: ResourceId,
    pub reason: FailureReason,
}

impl RunReport {
    pub fn from_session(session: &Session, recovery_events: usize) -> Self {
        let count = |status: WorkStatus| {
            session
                .outcomes
                .values()
                .filter(|r| r.status == status)
                .count()
        };
        let completed = count(WorkStatus::Completed);
        let failed = count(WorkStatus::Failed);
        let rolled_back = count(WorkStatus::RolledBack);
        let failures = session
            .outcomes
            .values()
            .filter(|r| r.status == WorkStatus::Failed)
            .filter_map(|r| {
                r.failure.clone().map(|reason| ResourceFailure {
                    resource: r.resource_id.clone(),
                    reason,
                })
            })
            .collect();
        Self {
            session_id: session.id.clone(),
            status: session.status,
            total: session.total_items,
            completed,
            failed,
            rolled_back,
            pending: session
                .total_items
                .saturating_sub(completed + failed + rolled_back),
            overrun_units: session.outcomes.values().map(|r| r.overrun).sum(),
            recovery_events,
            failures,
        }
    }

    /// 0 clean, 1 completed with failures, 2 aborted, 4 paused, 5 still active.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            SessionStatus::Completed if self.failed == 0 => 0,
            SessionStatus::Completed => 1,
            SessionStatus::Aborted => 2,
            SessionStatus::Paused => 4,
            SessionStatus::Active => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shepherd_core::{SessionManifest, WorkResult};
    use std::collections::BTreeMap;

    fn session(status: SessionStatus, results: &[(&str, WorkStatus)]) -> Session {
        let outcomes: BTreeMap<_, _> = results
            .iter()
            .map(|(id, status)| {
                (
                    ResourceId::from(*id),
                    WorkResult {
                        resource_id: ResourceId::from(*id),
                        status: *status,
                        stages: Vec::new(),
                        findings: Vec::new(),
                        cost: 1,
                        overrun: 1,
                        failure: (*status == WorkStatus::Failed)
                            .then(|| FailureReason::StageTimeout { stage: "t".into() }),
                        recorded_at: Utc::now(),
                    },
                )
            })
            .collect();
        Session {
            id: "s1".into(),
            status,
            started_at: Utc::now(),
            total_items: 4,
            completed_items: 0,
            failed_items: 0,
            outcomes,
            manifest: SessionManifest {
                root: "/repo".into(),
                feed: None,
                config: None,
            },
        }
    }

    #[test]
    fn test_counts_and_exit_codes() {
        let report = RunReport::from_session(
            &session(
                SessionStatus::Completed,
                &[("a", WorkStatus::Completed), ("b", WorkStatus::Failed)],
            ),
            0,
        );
        assert_eq!((report.completed, report.failed, report.pending), (1, 1, 2));
        assert_eq!(report.overrun_units, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.exit_code(), 1);

        let clean = RunReport::from_session(&session(SessionStatus::Completed, &[]), 0);
        assert_eq!(clean.exit_code(), 0);
        let aborted = RunReport::from_session(
            &session(SessionStatus::Aborted, &[("a", WorkStatus::RolledBack)]),
            0,
        );
        assert_eq!(aborted.rolled_back, 1);
        assert_eq!(aborted.exit_code(), 2);
        assert_eq!(
            RunReport::from_session(&session(SessionStatus::Paused, &[]), 0).exit_code(),
            4
        );
    }
}
