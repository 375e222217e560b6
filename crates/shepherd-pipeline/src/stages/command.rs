//! Stage backed by an external agent process.
//!
//! The process receives the resource content on stdin and `SHEPHERD_RESOURCE` /
//! `SHEPHERD_STAGE` in its environment. It answers with one JSON object on stdout:
//!
//! ```json
//! {"outcome": "ok", "modified": "new file text", "findings": [{"message": "..."}], "cost": 3}
//! ```
//!
//! Every field is optional; empty stdout means `ok` at the estimated cost. A non-zero
//! exit status is a hard failure. Content that is not UTF-8 goes in `modified_base64`
//! (standard alphabet, padded) instead of `modified`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::stage::{StageReport, WorkStage};
use shepherd_core::config::{StageKind, StageSpec};
use shepherd_core::{Error, Finding, Resource, Result, StageOutcome};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CommandReport {
    outcome: Option<String>,
    message: Option<String>,
    modified: Option<String>,
    modified_base64: Option<String>,
    findings: Vec<CommandFinding>,
    cost: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CommandFinding {
    message: String,
    #[serde(default)]
    detail: Option<serde_json::Value>,
}

pub struct CommandStage {
    spec: StageSpec,
}

impl CommandStage {
    pub fn new(spec: StageSpec) -> Result<Self> {
        if spec.command.is_empty() {
            return Err(Error::Configuration(format!(
                "stage '{}' has an empty command",
                spec.name
            )));
        }
        Ok(Self { spec })
    }

    fn parse_report(&self, raw: CommandReport, estimate: u64) -> Result<StageReport> {
        let message = raw.message.unwrap_or_default();
        let outcome = match raw.outcome.as_deref().unwrap_or("ok") {
            "ok" => StageOutcome::Ok,
            "soft_failure" => StageOutcome::SoftFailure(message),
            "hard_failure" => StageOutcome::HardFailure(message),
            other => {
                return Err(Error::Stage(format!(
                    "stage '{}' reported unknown outcome '{}'",
                    self.spec.name, other
                )))
            }
        };
        let modified = match (raw.modified, raw.modified_base64) {
            (Some(_), Some(_)) => {
                return Err(Error::Stage(format!(
                    "stage '{}' reported both modified and modified_base64",
                    self.spec.name
                )))
            }
            (Some(text), None) => Some(text.into_bytes()),
            (None, Some(encoded)) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| {
                        Error::Stage(format!(
                            "stage '{}' reported invalid modified_base64: {}",
                            self.spec.name, e
                        ))
                    })?,
            ),
            (None, None) => None,
        };
        Ok(StageReport {
            modified,
            findings: raw
                .findings
                .into_iter()
                .map(|f| Finding {
                    stage: self.spec.name.clone(),
                    message: f.message,
                    detail: f.detail,
                })
                .collect(),
            cost: raw.cost.unwrap_or(estimate),
            outcome,
        })
    }
}

#[async_trait]
impl WorkStage for CommandStage {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn kind(&self) -> StageKind {
        self.spec.kind
    }

    fn estimate_cost(&self, _resource: &Resource, size_bytes: u64) -> u64 {
        self.spec.cost.estimate(size_bytes)
    }

    fn timeout(&self) -> Option<Duration> {
        self.spec.timeout_secs.map(Duration::from_secs)
    }

    async fn run(&self, resource: &Resource, content: &[u8]) -> Result<StageReport> {
        let estimate = self.spec.cost.estimate(content.len() as u64);
        let (program, args) = self
            .spec
            .command
            .split_first()
            .ok_or_else(|| Error::Configuration(format!("stage '{}' has no command", self.spec.name)))?;

        let mut child = Command::new(program)
            .args(args)
            .env("SHEPHERD_RESOURCE", &resource.path)
            .env("SHEPHERD_STAGE", &self.spec.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Stage(format!("failed to spawn '{}': {}", program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = content.to_vec();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!("Stage process closed stdin early: {}", e);
                }
            });
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Stage(format!("failed to wait for '{}': {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "Stage '{}' exited with {} on {}",
                self.spec.name, output.status, resource.id
            );
            return Ok(StageReport::hard_failure(
                estimate,
                format!("exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(StageReport::ok(estimate));
        }
        let raw: CommandReport = serde_json::from_str(stdout.trim()).map_err(|e| {
            Error::Stage(format!(
                "stage '{}' produced invalid report: {}",
                self.spec.name, e
            ))
        })?;
        self.parse_report(raw, estimate)
    }
}
