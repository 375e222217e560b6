//! Shepherd Store: SQLite-backed durable state with single-transaction commits.
//!
//! One logical table per entity (sessions, checkpoints, locks, backups, budget
//! windows, recovery events) plus an append-only JSONL analytics log.

pub mod analytics;
pub mod schema;
pub mod session;
pub mod sqlite;
pub mod types;

pub use analytics::AnalyticsLog;
pub use session::{Checkpoint, ProgressSnapshot, Session, SessionStore};
pub use sqlite::SqliteStore;
pub use types::*;
