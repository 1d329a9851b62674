//! The pacing gate every outbound call passes through.

use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Enforces a minimum interval between the starts of consecutive calls.
///
/// Failed calls count too: the gate is acquired before the call is issued,
/// so its outcome is irrelevant.
#[derive(Debug)]
pub struct RateGate {
    interval: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_start: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until the next call may start, then record its start.
    /// Returns how long the caller was held back.
    pub fn acquire(&self) -> Duration {
        let mut last = self.last_start.lock().unwrap_or_else(PoisonError::into_inner);
        let waited = match *last {
            Some(prev) => {
                let ready = prev + self.interval;
                let now = Instant::now();
                if ready > now {
                    let wait = ready - now;
                    thread::sleep(wait);
                    wait
                } else {
                    Duration::ZERO
                }
            }
            None => Duration::ZERO,
        };
        *last = Some(Instant::now());
        waited
    }

    /// Push the next start out by at least `delay` (e.g. a `Retry-After`).
    pub fn hold_for(&self, delay: Duration) {
        let mut last = self.last_start.lock().unwrap_or_else(PoisonError::into_inner);
        let until = Instant::now() + delay;
        // Express "not before `until`" as a synthetic last start.
        let synthetic = until.checked_sub(self.interval).unwrap_or(until);
        if last.map_or(true, |prev| prev < synthetic) {
            *last = Some(synthetic);
        }
    }
}
