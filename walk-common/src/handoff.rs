//! Handoff seam between the batch scheduler and whatever receives its snapshots.
//!
//! A sink hands out a [`HandoffSlot`] once it holds exclusive access to its storage; dropping the
//! slot gives that access back. The scheduler never sees the exclusion primitive itself.

use std::time::{Duration, Instant};

use crate::error::EngineError;
use crate::snapshot::Snapshot;

/// Bounded retry with fixed backoff. At most `retries + 1` attempts, separated by sleeps that never
/// run past the deadline `retries * backoff` from the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl HandoffPolicy {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        HandoffPolicy { retries, backoff }
    }

    /// Deadline for the whole wait, measured from the first attempt. Only the cost of the final
    /// attempt can land past it.
    pub fn budget(&self) -> Duration {
        self.backoff * self.retries
    }

    /// Calls `attempt` until it reports success, an error, the retry bound is exhausted or the
    /// deadline has passed. Returns the number of attempts made on success.
    pub fn run<F>(&self, mut attempt: F) -> Result<u32, EngineError>
    where
        F: FnMut() -> Result<bool, EngineError>,
    {
        let started = Instant::now();
        let deadline = started + self.budget();
        let max_attempts = self.retries.saturating_add(1);
        let mut attempts = 0;
        while attempts < max_attempts {
            attempts += 1;
            if attempt()? {
                return Ok(attempts);
            }
            if attempts == max_attempts {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            std::thread::sleep(self.backoff.min(remaining));
        }
        Err(EngineError::HandoffTimeout { attempts, waited: started.elapsed() })
    }
}

/// Exclusive write access to a sink's storage, released on drop.
pub trait HandoffSlot {
    /// Writes the snapshot, cutting it down to the sink's capacity if needed.
    /// Returns the number of records actually written.
    fn write(&mut self, snapshot: &Snapshot) -> Result<usize, EngineError>;
}

/// Something the scheduler can publish snapshots to.
pub trait SnapshotSink {
    type Slot<'a>: HandoffSlot
    where
        Self: 'a;

    /// Blocks (bounded) until exclusive access is held.
    fn acquire_slot(&mut self) -> Result<Self::Slot<'_>, EngineError>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}
