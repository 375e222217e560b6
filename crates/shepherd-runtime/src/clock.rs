//! Wall-clock timestamps that only move with the monotonic clock.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use shepherd_core::Clock;

/// Wall time sampled once, then advanced by `tokio::time::Instant`.
///
/// Budget windows and lock expiry never jump when the system clock is adjusted, and
/// follow paused time in tests.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor: DateTime<Utc>,
    started: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            started: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.anchor + elapsed
    }
}
