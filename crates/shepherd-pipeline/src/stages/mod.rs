//! Built-in stages.

pub mod command;
pub mod fingerprint;

pub use command::CommandStage;
pub use fingerprint::FingerprintStage;
