//! Shepherd Risk: scores resources and orders them into waves.
//!
//! The score is a pure function of dependents, complexity, criticality and the
//! configured weights. The graph buckets resources into one wave per tier and answers
//! which resource may start next under the per-wave concurrency caps.

pub mod feed;
pub mod graph;
pub mod score;

pub use feed::{scan_dir, DependencyFeed, FeedEntry};
pub use graph::{RiskGraph, Wave};
pub use score::{classify, risk_score, RiskInputs};
