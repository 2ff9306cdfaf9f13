//! Wall-clock timestamps with nanosecond resolution.
//!
//! [`Timestamp`] wraps a `u64` of nanoseconds since the Unix epoch. Unlike a
//! monotonic reading it is comparable with exchange server times, which is
//! what clock synchronization needs. [`Timestamp::now`] reads
//! `CLOCK_REALTIME` directly on Linux and macOS.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const NANOS_PER_MILLI: u64 = 1_000_000;
const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Nanosecond-precision wall-clock timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Read the local wall clock.
    ///
    /// This is the raw, unsynchronized system time. Anything that is sent to
    /// an exchange should go through a synchronized [`crate::clock::Clock`]
    /// instead.
    #[inline]
    pub fn now() -> Self {
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            Self(realtime_nanos())
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            use std::time::{SystemTime, UNIX_EPOCH};
            let dur = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            Self(dur.as_nanos() as u64)
        }
    }

    /// Create a timestamp from milliseconds since the epoch.
    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms.saturating_mul(NANOS_PER_MILLI))
    }

    /// Create a timestamp from nanoseconds since the epoch.
    #[inline]
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    /// Convert to whole milliseconds since the epoch (truncating).
    #[inline]
    pub const fn to_millis(&self) -> u64 {
        self.0 / NANOS_PER_MILLI
    }

    /// Returns the raw nanosecond value.
    #[inline]
    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Elapsed time from `earlier` to `self`, zero if `earlier` is later.
    #[inline]
    pub fn elapsed_since(&self, earlier: &Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// Signed difference `self - other` in milliseconds.
    #[inline]
    pub fn signed_millis_since(&self, other: &Timestamp) -> i64 {
        let diff = self.0 as i128 - other.0 as i128;
        (diff / NANOS_PER_MILLI as i128) as i64
    }

    /// Shift the timestamp by a signed number of milliseconds, saturating at
    /// the epoch and at `u64::MAX`.
    #[inline]
    pub fn offset_by_millis(&self, offset_ms: i64) -> Self {
        let shift = offset_ms as i128 * NANOS_PER_MILLI as i128;
        let shifted = (self.0 as i128 + shift).clamp(0, u64::MAX as i128);
        Self(shifted as u64)
    }

    /// Shift the timestamp forward by a duration.
    #[inline]
    pub fn add_duration(&self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_nanos().min(u64::MAX as u128) as u64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0 / NANOS_PER_SEC;
        let nanos = self.0 % NANOS_PER_SEC;
        write!(f, "{}.{:09}", secs, nanos)
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn realtime_nanos() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: passing a valid pointer to a stack-allocated timespec.
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    ts.tv_sec as u64 * NANOS_PER_SEC + ts.tv_nsec as u64
}
