//! Shepherd Core: shared domain types, configuration, clock and errors.

pub mod clock;
pub mod config;
pub mod error;
pub mod tier;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DataPaths, ShepherdConfig};
pub use error::{Error, Result};
pub use tier::RiskTier;
pub use types::*;
