//! Per-queue logical clock.
//!
//! A 63-bit Lamport-style counter that advances by 2 per tick, so every
//! value it hands out is even and the low bit stays free for the stage flag.
//! The clock is owned by its queue and only ever mutated under the queue
//! lock; it never moves backwards.

use capbus_error::{BusError, Result};
use capbus_types::Timestamp;

/// Monotonic even-stepped clock.
#[derive(Debug)]
pub struct Clock {
    now: u64,
}

impl Clock {
    /// Largest value the clock may reach: the greatest even 63-bit value.
    /// Ticking past this would collide the staging stamp with the sign of
    /// the packed word, so `tick` and `sync` refuse instead.
    pub const MAX: u64 = Timestamp::MAX_RAW - 1;

    #[must_use]
    pub fn new() -> Self {
        Self { now: 0 }
    }

    /// Current clock value as a timestamp (0 before the first tick).
    #[must_use]
    pub fn now(&self) -> Timestamp {
        Timestamp::new(self.now).expect("clock value stays in timestamp domain")
    }

    /// Advance by 2 and return the new value.
    ///
    /// The result is even and strictly greater than every previously
    /// returned tick of this clock.
    pub fn tick(&mut self) -> Result<Timestamp> {
        if self.now >= Self::MAX {
            tracing::warn!(clock = self.now, "logical clock exhausted, refusing tick");
            return Err(BusError::ClockExhausted);
        }
        self.now += 2;
        Ok(self.now())
    }

    /// Raise the clock to at least `at_least` (rounded up to even) and
    /// return the resulting value. Idempotent; never lowers the clock.
    pub fn sync(&mut self, at_least: Timestamp) -> Result<Timestamp> {
        let rounded = at_least.get().checked_add(at_least.get() & 1).ok_or_else(|| {
            tracing::warn!(at_least = at_least.get(), "clock sync target overflows");
            BusError::ClockExhausted
        })?;
        if rounded > Self::MAX {
            tracing::warn!(at_least = at_least.get(), "clock sync target exhausts clock");
            return Err(BusError::ClockExhausted);
        }
        if rounded > self.now {
            self.now = rounded;
        }
        Ok(self.now())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
