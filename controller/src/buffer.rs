use std::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Spaces out the start of successive drains across the fleet.
///
/// Only start times are serialized; drains themselves may overlap. Reserving never waits, it hands back the
/// instant the caller should wait until.
#[derive(Debug)]
pub struct DrainBuffer {
    spacing: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl DrainBuffer {
    pub fn new(spacing: Duration) -> Self {
        DrainBuffer {
            spacing,
            last_start: Mutex::new(None),
        }
    }

    /// Reserves the earliest start time no earlier than `now` that is at least `spacing` after the previous
    /// reservation. The first reservation is unconstrained.
    pub fn reserve(&self, now: Instant) -> Instant {
        let mut last_start = self
            .last_start
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let start = match *last_start {
            Some(last) => now.max(last + self.spacing),
            None => now,
        };
        *last_start = Some(start);
        start
    }
}
