//! Error types for Shepherd.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Checkpoint corruption in session {session_id}: {reason}")]
    CheckpointCorruption { session_id: String, reason: String },

    #[error("Lock lost: {0}")]
    LockLost(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Stage error: {0}")]
    Stage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whole-session errors abort the run and are reported to the operator directly.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::CheckpointCorruption { .. } | Self::SessionClosed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_fatal_classification() {
        assert!(Error::Configuration("cycle".into()).is_session_fatal());
        assert!(Error::SessionClosed("s1".into()).is_session_fatal());
        assert!(Error::CheckpointCorruption {
            session_id: "s1".into(),
            reason: "checksum".into(),
        }
        .is_session_fatal());
        assert!(!Error::LockLost("a.rs".into()).is_session_fatal());
        assert!(!Error::Stage("boom".into()).is_session_fatal());
    }

    #[test]
    fn test_display_includes_session() {
        let err = Error::CheckpointCorruption {
            session_id: "abc".into(),
            reason: "checksum mismatch".into(),
        };
        assert_eq!(
            err.to_string(),
            "Checkpoint corruption in session abc: checksum mismatch"
        );
    }
}
