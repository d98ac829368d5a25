//! Progressive waiting on a condition variable with an overall timeout.

use crate::storage::error::{StorageError, StorageResult};
use parking_lot::{Condvar, MutexGuard};
use std::time::{Duration, Instant};

// Re-poll intervals between unlock notifications.
const FAST_ROUNDS: u32 = 100;
const MEDIUM_ROUNDS: u32 = 500;
const FAST_STEP: Duration = Duration::from_micros(200);
const MEDIUM_STEP: Duration = Duration::from_millis(1);
const SLOW_AFTER: Duration = Duration::from_secs(1);
const MEDIUM_LONG_STEP: Duration = Duration::from_millis(5);
const SLOW_STEP: Duration = Duration::from_millis(50);

/// Tracks one caller's wait for a contended resource.
///
/// A zero timeout waits forever.
#[derive(Debug)]
pub struct ProgressiveWait {
    timeout: Duration,
    started: Instant,
    rounds: u32,
}

impl ProgressiveWait {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            started: Instant::now(),
            rounds: 0,
        }
    }

    pub fn waited(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    fn step(&self) -> Duration {
        if self.rounds < FAST_ROUNDS {
            FAST_STEP
        } else if self.rounds < MEDIUM_ROUNDS {
            MEDIUM_STEP
        } else if self.waited() < SLOW_AFTER {
            MEDIUM_LONG_STEP
        } else {
            SLOW_STEP
        }
    }

    /// Block on `condvar` for one step, or fail once the timeout has elapsed.
    ///
    /// `name` describes the resource and is only evaluated on timeout.
    pub fn wait<T, F>(
        &mut self,
        condvar: &Condvar,
        guard: &mut MutexGuard<'_, T>,
        name: F,
    ) -> StorageResult<()>
    where
        F: FnOnce() -> String,
    {
        let mut step = self.step();
        if !self.timeout.is_zero() {
            let waited = self.waited();
            if waited >= self.timeout {
                return Err(StorageError::Timeout {
                    name: name(),
                    waited,
                });
            }
            step = step.min(self.timeout - waited);
        }

        condvar.wait_for(guard, step);
        self.rounds += 1;
        Ok(())
    }
}
