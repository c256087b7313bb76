//! Time source for consensus timing and record timestamps.
//!
//! Consensus deadlines use the monotonic reading; everything persisted uses
//! wall-clock UTC. Keeping both behind one trait lets tests drive elections
//! without real sleeps.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Clock consumed by the core; wall time for records, monotonic for timeouts.
pub trait Clock: Send + Sync {
    /// Current wall-clock time in UTC.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic duration since the clock was created.
    fn monotonic(&self) -> Duration;
}

/// Process clock backed by [`Utc::now`] and [`Instant`].
#[derive(Debug)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.started.elapsed()
    }
}
