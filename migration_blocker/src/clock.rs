//! Logical clock handing out timestamps for durable migration writes.

use utils::timestamp::{AtomicTimestamp, Timestamp};

/// Monotone source of [`Timestamp`]s.
///
/// Every timestamp handed out by [`LogicalClock::tick`] is greater than any
/// timestamp issued or observed before, so a block timestamp assigned after
/// a restart can never fall below one that was persisted earlier.
pub struct LogicalClock {
    last: AtomicTimestamp,
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new(Timestamp::INVALID)
    }
}

impl LogicalClock {
    pub fn new(start: Timestamp) -> Self {
        LogicalClock {
            last: AtomicTimestamp::from(start),
        }
    }

    /// The latest timestamp issued or observed.
    pub fn now(&self) -> Timestamp {
        self.last.load()
    }

    /// Issue a fresh timestamp.
    pub fn tick(&self) -> Timestamp {
        self.last.tick()
    }

    /// Make sure future ticks are above `ts`.
    pub fn observe(&self, ts: Timestamp) {
        self.last.fetch_max(ts);
    }
}
