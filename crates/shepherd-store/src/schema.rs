//! Database schema SQL. Timestamps are milliseconds since the Unix epoch.

/// Session lifecycle: sessions, their items, and the append-only result log.
pub const SESSION_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    total_items INTEGER NOT NULL,
    completed_items INTEGER NOT NULL DEFAULT 0,
    failed_items INTEGER NOT NULL DEFAULT 0,
    manifest_json TEXT NOT NULL,
    cancel_requested INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS session_items (
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    resource_id TEXT NOT NULL,
    path TEXT NOT NULL,
    tier TEXT NOT NULL,
    wave INTEGER NOT NULL,
    risk REAL NOT NULL,
    PRIMARY KEY (session_id, resource_id)
);

CREATE TABLE IF NOT EXISTS work_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    resource_id TEXT NOT NULL,
    status TEXT NOT NULL,
    cost INTEGER NOT NULL,
    overrun INTEGER NOT NULL DEFAULT 0,
    result_json TEXT NOT NULL,
    recorded_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_work_results_session ON work_results(session_id, resource_id);

CREATE TABLE IF NOT EXISTS checkpoints (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    snapshot_json TEXT NOT NULL,
    checksum TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_session ON checkpoints(session_id, seq);
"#;

/// Coordination state: locks, rollback backups, budget windows, recovery events.
pub const COORDINATION_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS locks (
    resource_id TEXT PRIMARY KEY,
    holder_id TEXT NOT NULL,
    token TEXT NOT NULL,
    session_id TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS backups (
    session_id TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    existed INTEGER NOT NULL,
    content BLOB,
    PRIMARY KEY (session_id, resource_id)
);

CREATE TABLE IF NOT EXISTS budget_windows (
    scope TEXT NOT NULL,
    kind TEXT NOT NULL,
    limit_units INTEGER NOT NULL,
    consumed INTEGER NOT NULL,
    window_start INTEGER NOT NULL,
    window_end INTEGER,
    epoch INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (scope, kind)
);

CREATE TABLE IF NOT EXISTS recovery_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    previous_holder TEXT,
    detail TEXT NOT NULL,
    occurred_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_recovery_session ON recovery_events(session_id);
"#;
