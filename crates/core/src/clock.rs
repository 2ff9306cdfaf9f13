//! Time sources.
//!
//! Every component that stamps or validates time does so through the
//! [`Clock`] trait instead of calling [`Timestamp::now`] directly, so a
//! synchronized clock can be swapped in at runtime and tests can drive time
//! by hand with [`ManualClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::types::Timestamp;

/// A source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current time according to this clock.
    fn now(&self) -> Timestamp;
}

/// The unsynchronized local system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            nanos: AtomicU64::new(start.as_nanos()),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let by = by.as_nanos().min(u64::MAX as u128) as u64;
        self.nanos.fetch_add(by, Ordering::SeqCst);
    }

    /// Jump to an absolute time (may move backwards).
    pub fn set(&self, to: Timestamp) {
        self.nanos.store(to.as_nanos(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> Timestamp {
        Timestamp(self.nanos.load(Ordering::SeqCst))
    }
}
