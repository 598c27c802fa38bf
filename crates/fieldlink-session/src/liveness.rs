//! Liveness timestamp shared between the receive pump (writer) and the
//! send cycle / external timeout logic (readers).

use quanta::Instant;
use std::sync::Mutex;
use std::time::Duration;

/// Monotonic timestamp of the most recent inbound datagram.
#[derive(Debug)]
pub struct RecvTimestamp {
    last: Mutex<Instant>,
}

impl RecvTimestamp {
    pub fn new() -> Self {
        RecvTimestamp {
            last: Mutex::new(Instant::now()),
        }
    }

    /// Record that a datagram just arrived.
    pub fn reset(&self) {
        *self.lock() = Instant::now();
    }

    /// Time since the last inbound datagram.
    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for RecvTimestamp {
    fn default() -> Self {
        Self::new()
    }
}
