//! Append-only JSONL analytics log of recorded work results.

use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;

use shepherd_core::{Result, WorkResult};

#[derive(Serialize)]
struct AnalyticsLine<'a> {
    session_id: &'a str,
    #[serde(flatten)]
    result: &'a WorkResult,
}

/// One JSON object per line; writers are serialized by an internal mutex.
pub struct AnalyticsLog {
    path: PathBuf,
    guard: Mutex<()>,
}

impl AnalyticsLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, session_id: &str, result: &WorkResult) -> Result<()> {
        let mut line = serde_json::to_vec(&AnalyticsLine { session_id, result })?;
        line.push(b'\n');

        let _guard = self.guard.lock();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }
}
