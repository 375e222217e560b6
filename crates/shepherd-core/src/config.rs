//! Configuration and data directory management.
//!
//! Every tunable (risk weights, tier thresholds, concurrency caps, budget windows,
//! lock TTLs, stage commands) lives here so tuning never needs a recompile.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Paths to Shepherd's durable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `.shepherd/`).
    pub root: PathBuf,
    /// SQLite database holding sessions, checkpoints, locks, windows and backups.
    pub db_file: PathBuf,
    /// Append-only JSONL log of every recorded work result.
    pub analytics_log: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            db_file: root.join("shepherd.db"),
            analytics_log: root.join("analytics.jsonl"),
            root,
        })
    }
}

/// Weights of the risk formula `dependents*w1 + complexity*w2 + criticality*w3`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub dependents: f64,
    pub complexity: f64,
    pub criticality: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            dependents: 1.0,
            complexity: 0.5,
            criticality: 2.0,
        }
    }
}

/// Lower score bounds of each tier; anything below `medium` is low.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierThresholds {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            critical: 20.0,
            high: 10.0,
            medium: 4.0,
        }
    }
}

/// Which end of the risk scale is scheduled first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveOrder {
    #[default]
    HighestRiskFirst,
    LowestRiskFirst,
}

/// Per-wave concurrency caps. Critical is always 1 and not configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyCaps {
    pub high: usize,
    pub medium: Option<usize>,
    pub low: Option<usize>,
}

impl Default for ConcurrencyCaps {
    fn default() -> Self {
        Self {
            high: 2,
            medium: None,
            low: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub weights: RiskWeights,
    pub thresholds: TierThresholds,
    pub wave_order: WaveOrder,
    pub caps: ConcurrencyCaps,
}

impl RiskConfig {
    /// Weights must be finite and non-negative, thresholds strictly descending.
    pub fn validate(&self) -> Result<()> {
        let w = &self.weights;
        for (name, value) in [
            ("dependents", w.dependents),
            ("complexity", w.complexity),
            ("criticality", w.criticality),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Configuration(format!(
                    "risk weight '{name}' must be a finite non-negative number, got {value}"
                )));
            }
        }

        let t = &self.thresholds;
        if ![t.critical, t.high, t.medium].iter().all(|v| v.is_finite()) {
            return Err(Error::Configuration("tier thresholds must be finite".into()));
        }
        if !(t.critical > t.high && t.high > t.medium) {
            return Err(Error::Configuration(format!(
                "tier thresholds must be strictly descending (critical {} > high {} > medium {})",
                t.critical, t.high, t.medium
            )));
        }

        let caps = &self.caps;
        if caps.high == 0 || caps.medium == Some(0) || caps.low == Some(0) {
            return Err(Error::Configuration("concurrency caps must be at least 1".into()));
        }

        Ok(())
    }
}

/// Reset cadence of a budget window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Lives as long as the session; never resets.
    Session,
    Hourly,
    Daily,
    /// Rolling window of an arbitrary length.
    Rolling { seconds: u64 },
}

impl WindowKind {
    /// Length of one window period; `None` for windows that never reset.
    pub fn period(self) -> Option<chrono::Duration> {
        match self {
            Self::Session => None,
            Self::Hourly => Some(chrono::Duration::hours(1)),
            Self::Daily => Some(chrono::Duration::days(1)),
            Self::Rolling { seconds } => i64::try_from(seconds)
                .ok()
                .map(chrono::Duration::seconds),
        }
    }

    /// Stable key used when persisting windows.
    pub fn key(self) -> String {
        match self {
            Self::Session => "session".into(),
            Self::Hourly => "hourly".into(),
            Self::Daily => "daily".into(),
            Self::Rolling { seconds } => format!("rolling:{seconds}"),
        }
    }

    /// Inverse of [`WindowKind::key`].
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "session" => Some(Self::Session),
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            other => other
                .strip_prefix("rolling:")
                .and_then(|s| s.parse().ok())
                .map(|seconds| Self::Rolling { seconds }),
        }
    }
}

impl std::fmt::Display for WindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub kind: WindowKind,
    pub limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub windows: Vec<WindowConfig>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            windows: vec![
                WindowConfig {
                    kind: WindowKind::Hourly,
                    limit: 500,
                },
                WindowConfig {
                    kind: WindowKind::Daily,
                    limit: 5_000,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub ttl_secs: u64,
    pub busy_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            busy_backoff_ms: 500,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ttl_secs)
    }

    pub fn busy_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.busy_backoff_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Size of the worker pool.
    pub workers: usize,
    /// Default deadline of every pipeline stage.
    pub stage_timeout_secs: u64,
    /// Checkpoint after this many recorded results...
    pub checkpoint_every_items: usize,
    /// ...or after this much time, whichever comes first.
    pub checkpoint_interval_secs: u64,
    /// How often the driver loop polls the store for an external cancel request.
    pub cancel_poll_ms: u64,
    /// Upper bound of a single budget backoff sleep.
    pub max_backoff_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            stage_timeout_secs: 600,
            checkpoint_every_items: 10,
            checkpoint_interval_secs: 30,
            cancel_poll_ms: 1_000,
            max_backoff_secs: 300,
        }
    }
}

/// Role of a stage in the inspect → transform → verify sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Inspect,
    Transform,
    Verify,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inspect => write!(f, "inspect"),
            Self::Transform => write!(f, "transform"),
            Self::Verify => write!(f, "verify"),
        }
    }
}

/// Linear cost estimate: `base + per_kib * ceil(size / 1024)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    pub base: u64,
    pub per_kib: u64,
}

impl CostModel {
    pub fn estimate(&self, size_bytes: u64) -> u64 {
        let kib = size_bytes.div_ceil(1024);
        self.base.saturating_add(self.per_kib.saturating_mul(kib))
    }
}

/// An externally implemented stage: a command that receives the file on stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub kind: StageKind,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    #[serde(default)]
    pub cost: CostModel,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_pipeline() -> Vec<String> {
    vec!["fingerprint".into()]
}

/// Top-level Shepherd configuration (persisted as `shepherd.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShepherdConfig {
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
    #[serde(default = "default_pipeline")]
    pub pipeline: Vec<String>,
}

impl Default for ShepherdConfig {
    fn default() -> Self {
        Self {
            risk: RiskConfig::default(),
            budget: BudgetConfig::default(),
            locks: LockConfig::default(),
            scheduler: SchedulerConfig::default(),
            stages: Vec::new(),
            pipeline: default_pipeline(),
        }
    }
}

impl ShepherdConfig {
    /// Load config from a JSON file, falling back to defaults when the file is absent.
    ///
    /// A file that exists but does not parse or validate is a configuration error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                let parsed: ShepherdConfig = serde_json::from_str(&raw).map_err(|e| {
                    Error::Configuration(format!("{}: {}", path.display(), e))
                })?;
                info!("Loaded configuration from {}", path.display());
                parsed
            }
            _ => Self::default(),
        };

        if let Some(workers) = std::env::var("SHEPHERD_WORKERS")
            .ok()
            .and_then(|w| w.parse().ok())
        {
            config.scheduler.workers = workers;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject malformed weights, thresholds, windows and pipeline definitions.
    pub fn validate(&self) -> Result<()> {
        self.risk.validate()?;

        if self.scheduler.workers == 0 {
            return Err(Error::Configuration("scheduler.workers must be at least 1".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for window in &self.budget.windows {
            if window.limit == 0 {
                return Err(Error::Configuration(format!(
                    "budget window '{}' has a zero limit",
                    window.kind
                )));
            }
            if matches!(window.kind, WindowKind::Rolling { seconds: 0 }) {
                return Err(Error::Configuration("rolling window of zero seconds".into()));
            }
            if !seen.insert(window.kind) {
                return Err(Error::Configuration(format!(
                    "budget window '{}' configured twice",
                    window.kind
                )));
            }
        }

        for stage in &self.stages {
            if stage.command.is_empty() {
                return Err(Error::Configuration(format!(
                    "stage '{}' has an empty command",
                    stage.name
                )));
            }
        }

        if self.pipeline.is_empty() {
            return Err(Error::Configuration("pipeline has no stages".into()));
        }

        Ok(())
    }

    pub fn stage_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.scheduler.stage_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ShepherdConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline, vec!["fingerprint".to_string()]);
        assert_eq!(config.risk.caps.high, 2);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ShepherdConfig::load(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(config.budget.windows.len(), 2);
    }

    #[test]
    fn test_partial_file_merges_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shepherd.json");
        std::fs::write(
            &path,
            r#"{"risk": {"weights": {"dependents": 3.0}},
                "budget": {"windows": [{"kind": {"rolling": {"seconds": 60}}, "limit": 5}]}}"#,
        )
        .unwrap();
        let config = ShepherdConfig::load(Some(&path)).unwrap();
        assert_eq!(config.risk.weights.dependents, 3.0);
        assert_eq!(config.risk.weights.criticality, 2.0);
        assert_eq!(
            config.budget.windows[0].kind,
            WindowKind::Rolling { seconds: 60 }
        );
    }

    #[test]
    fn test_malformed_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shepherd.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = ShepherdConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_negative_weight_rejected() {
        let mut config = ShepherdConfig::default();
        config.risk.weights.complexity = -1.0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_thresholds_must_descend() {
        let mut config = ShepherdConfig::default();
        config.risk.thresholds.high = config.risk.thresholds.critical;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_duplicate_window_rejected() {
        let mut config = ShepherdConfig::default();
        config.budget.windows.push(WindowConfig {
            kind: WindowKind::Hourly,
            limit: 10,
        });
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_cost_model_rounds_up() {
        let model = CostModel { base: 1, per_kib: 2 };
        assert_eq!(model.estimate(0), 1);
        assert_eq!(model.estimate(1), 3);
        assert_eq!(model.estimate(2048), 5);
    }

    #[test]
    fn test_window_periods() {
        assert!(WindowKind::Session.period().is_none());
        assert_eq!(WindowKind::Hourly.period(), Some(chrono::Duration::hours(1)));
        assert_eq!(
            WindowKind::Rolling { seconds: 30 }.period(),
            Some(chrono::Duration::seconds(30))
        );
        assert_eq!(WindowKind::Rolling { seconds: 30 }.key(), "rolling:30");
        assert_eq!(
            WindowKind::from_key("rolling:30"),
            Some(WindowKind::Rolling { seconds: 30 })
        );
        assert_eq!(WindowKind::from_key("weekly"), None);
    }
}
