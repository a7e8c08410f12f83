//! Time source for the scheduler loop.
//!
//! - `SystemClock`: wall-clock UTC, the production default
//! - `MonotonicClock`: a wall-clock anchor advanced by tokio's monotonic
//!   clock, so paused/advanced tokio time in tests moves cron time with it

use chrono::{DateTime, Utc};
use tokio::time::Instant;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor: DateTime<Utc>,
    started: Instant,
}

impl MonotonicClock {
    /// Anchor at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Anchor at an arbitrary instant; `now()` returns exactly `anchor` until
    /// tokio time moves.
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
        let elapsed = self.started.elapsed();
        self.anchor + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
    }
}
