//! Typed stage registry.
//!
//! Stage names are resolved to implementations once, when a pipeline is built from
//! configuration. An unknown name is a configuration error at startup, never a
//! lookup failure mid-run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::pipeline::{PipelineStage, WorkPipeline};
use crate::stage::WorkStage;
use crate::stages::{CommandStage, FingerprintStage};
use shepherd_core::{Error, Result, ShepherdConfig};

#[derive(Default)]
pub struct StageRegistry {
    stages: BTreeMap<String, Arc<dyn WorkStage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in stages.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .stages
            .insert(FingerprintStage::NAME.to_string(), Arc::new(FingerprintStage::default()));
        registry
    }

    /// Built-ins plus every command stage declared in the configuration.
    pub fn from_config(config: &ShepherdConfig) -> Result<Self> {
        let mut registry = Self::with_builtins();
        for spec in &config.stages {
            registry.register(Arc::new(CommandStage::new(spec.clone())?))?;
        }
        Ok(registry)
    }

    /// Add a stage. Names must be unique.
    pub fn register(&mut self, stage: Arc<dyn WorkStage>) -> Result<()> {
        let name = stage.name().to_string();
        if self.stages.contains_key(&name) {
            return Err(Error::Configuration(format!(
                "stage '{}' registered twice",
                name
            )));
        }
        self.stages.insert(name, stage);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkStage>> {
        self.stages.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.keys().map(String::as_str).collect()
    }

    /// Resolve `names` in order into a pipeline.
    pub fn build(&self, names: &[String], default_deadline: Duration) -> Result<WorkPipeline> {
        if names.is_empty() {
            return Err(Error::Configuration("pipeline has no stages".into()));
        }
        let stages = names
            .iter()
            .map(|name| {
                self.get(name)
                    .map(|stage| PipelineStage::new(stage, default_deadline))
                    .ok_or_else(|| {
                        Error::Configuration(format!(
                            "unknown stage '{}' (known: {})",
                            name,
                            self.names().join(", ")
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let pipeline = WorkPipeline::new(stages);
        info!("Pipeline resolved: {}", pipeline.names().join(" -> "));
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_core::config::{CostModel, StageKind, StageSpec};

    fn spec(name: &str) -> StageSpec {
        StageSpec {
            name: name.into(),
            kind: StageKind::Transform,
            command: vec!["true".into()],
            cost: CostModel { base: 2, per_kib: 0 },
            timeout_secs: Some(7),
        }
    }

    #[test]
    fn test_build_resolves_in_order() {
        let mut config = ShepherdConfig::default();
        config.stages.push(spec("rewrite"));
        config.pipeline = vec!["fingerprint".into(), "rewrite".into()];

        let registry = StageRegistry::from_config(&config).unwrap();
        let pipeline = registry
            .build(&config.pipeline, Duration::from_secs(60))
            .unwrap();
        assert_eq!(pipeline.names(), vec!["fingerprint", "rewrite"]);
        assert_eq!(pipeline.stages()[0].deadline(), Duration::from_secs(60));
        assert_eq!(pipeline.stages()[1].deadline(), Duration::from_secs(7));
    }

    #[test]
    fn test_unknown_stage_is_configuration_error() {
        let registry = StageRegistry::with_builtins();
        let err = registry
            .build(&["lint".to_string()], Duration::from_secs(1))
            .unwrap_err();
        match err {
            Error::Configuration(msg) => assert!(msg.contains("lint")),
            other => panic!("expected configuration error, got {other:?}"),
        }
        assert!(registry.build(&[], Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut config = ShepherdConfig::default();
        config.stages.push(spec("fingerprint"));
        assert!(matches!(
            StageRegistry::from_config(&config),
            Err(Error::Configuration(_))
        ));
    }
}
