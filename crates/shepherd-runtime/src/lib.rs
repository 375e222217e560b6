//! Shepherd Runtime: admission, exclusion and the driver loop.
//!
//! [`BudgetLedger`] and [`LockTable`] decide whether a resource may start now,
//! [`Orchestrator`] pulls eligible work from the risk graph and drives a bounded
//! worker pool through the pipeline, recording every outcome in the session store.

pub mod budget;
pub mod cancel;
pub mod clock;
pub mod lock;
pub mod orchestrator;
pub mod types;
pub mod worker;
pub mod workspace;

pub use budget::{Admission, BudgetLedger, Reservation, Settlement};
pub use cancel::CancelToken;
pub use clock::MonotonicClock;
pub use lock::{Acquire, LockTable};
pub use orchestrator::Orchestrator;
pub use types::*;
pub use workspace::{FsWorkspace, InMemoryWorkspace, Workspace};
