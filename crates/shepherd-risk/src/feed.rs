//! Dependency feed: the static resource → {dependents, complexity, criticality} table
//! produced by an external analysis pass, optionally merged with a directory scan.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use shepherd_core::{Error, Result};

/// One row of the feed. `path` is relative to the target root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub path: String,
    #[serde(default)]
    pub dependents: Vec<String>,
    #[serde(default)]
    pub complexity: f64,
    #[serde(default)]
    pub criticality: f64,
}

impl FeedEntry {
    /// A resource known only from the directory scan.
    pub fn bare(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            dependents: Vec::new(),
            complexity: 0.0,
            criticality: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyFeed {
    #[serde(default)]
    pub resources: Vec<FeedEntry>,
}

impl DependencyFeed {
    pub fn new(resources: Vec<FeedEntry>) -> Self {
        Self { resources }
    }

    /// Parse a JSON feed file. Duplicate paths are rejected.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))?;
        let feed: DependencyFeed = serde_json::from_str(&raw)
            .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))?;
        feed.check_unique()?;
        info!(
            "Loaded dependency feed {} ({} resources)",
            path.display(),
            feed.resources.len()
        );
        Ok(feed)
    }

    fn check_unique(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.resources {
            if !seen.insert(entry.path.as_str()) {
                return Err(Error::Configuration(format!(
                    "dependency feed lists '{}' more than once",
                    entry.path
                )));
            }
        }
        Ok(())
    }

    /// Add every scanned path the feed does not already describe.
    pub fn merge_scan(&mut self, paths: impl IntoIterator<Item = String>) -> usize {
        let known: HashSet<String> = self.resources.iter().map(|e| e.path.clone()).collect();
        let before = self.resources.len();
        for path in paths {
            if !known.contains(&path) {
                self.resources.push(FeedEntry::bare(path));
            }
        }
        let added = self.resources.len() - before;
        debug!("Directory scan added {} resources to the feed", added);
        added
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Regular files under `root`, as sorted `/`-separated relative paths.
///
/// Hidden entries (names starting with `.`) are skipped, which keeps VCS metadata and
/// the scheduler's own data directory out of the target set.
pub fn scan_dir(root: &Path) -> Result<Vec<String>> {
    if !root.is_dir() {
        return Err(Error::Configuration(format!(
            "target root {} is not a directory",
            root.display()
        )));
    }
    let mut found = Vec::new();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    let parts: Vec<String> = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    found.push(parts.join("/"));
                }
            }
        }
    }
    found.sort();
    Ok(found)
}
