use serde::Deserialize;
use std::thread;
use std::time::Duration;

/// Bounded sleep-and-recheck loop.
///
/// Engine state transitions (stop after an interrupt, end of a step, end of an attach)
/// are observed by polling. The number of polls is always bounded so a stuck engine
/// can't freeze the dispatch loop, a caller decides what to do with [`PollOutcome::TimedOut`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    pub poll_interval_ms: u64,
    pub max_polls: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Ready,
    TimedOut,
}

impl PollOutcome {
    pub fn is_ready(self) -> bool {
        self == PollOutcome::Ready
    }
}

impl RetryPolicy {
    pub const fn new(poll_interval_ms: u64, max_polls: u32) -> Self {
        Self {
            poll_interval_ms,
            max_polls,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Check `ready` up to `max_polls + 1` times with a sleep between checks.
    pub fn poll(&self, mut ready: impl FnMut() -> bool) -> PollOutcome {
        for attempt in 0..=self.max_polls {
            if ready() {
                return PollOutcome::Ready;
            }
            if attempt < self.max_polls {
                thread::sleep(self.interval());
            }
        }
        PollOutcome::TimedOut
    }
}
