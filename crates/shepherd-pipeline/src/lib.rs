//! Shepherd Pipeline: pluggable stages applied to one resource.
//!
//! Stages implement [`WorkStage`] and are resolved by name once, when the
//! [`StageRegistry`] builds a [`WorkPipeline`] from configuration.

pub mod pipeline;
pub mod registry;
pub mod stage;
pub mod stages;

pub use pipeline::{PipelineStage, StageRun, WorkPipeline};
pub use registry::StageRegistry;
pub use stage::{StageReport, WorkStage};
pub use stages::{CommandStage, FingerprintStage};
