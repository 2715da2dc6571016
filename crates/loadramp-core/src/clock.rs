//! Run clock: every sample timestamp is an offset from run start

use std::time::Duration;

use tokio::time::Instant;

/// Monotonic clock anchored at run start. Built on tokio's clock so paused
/// test time drives it too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunClock {
    start: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn started_at(&self) -> Instant {
        self.start
    }
}

impl Default for RunClock {
    fn default() -> Self {
        Self::start()
    }
}
