//! Events emitted by the clock synchronization service.

use std::time::Duration;

use tw_core::types::Timestamp;

use crate::sample::DriftWarning;

/// Advisory notifications from [`crate::ClockSyncService`]. Consumers decide
/// how much staleness they tolerate.
#[derive(Debug, Clone, PartialEq)]
pub enum ClockEvent {
    /// An exchange probe succeeded.
    Sync {
        exchange: String,
        server_time: Timestamp,
        network_latency: Duration,
        sync_count: u64,
    },
    /// An NTP query succeeded.
    NtpSync {
        server: String,
        offset_ms: i64,
        round_trip: Duration,
    },
    /// A probe or NTP query failed. `source` is the exchange name or `ntp`.
    SyncError { source: String, message: String },
    /// An exchange clock is further away than the configured maximum.
    DriftWarning(DriftWarning),
    HealthChanged { healthy: bool },
}

impl ClockEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClockEvent::Sync { .. } => "sync",
            ClockEvent::NtpSync { .. } => "ntp_sync",
            ClockEvent::SyncError { .. } => "sync_error",
            ClockEvent::DriftWarning(_) => "drift_warning",
            ClockEvent::HealthChanged { .. } => "health_changed",
        }
    }
}
