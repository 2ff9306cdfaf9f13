//! Time measurements and the views derived from them.

use std::time::Duration;

use serde::Serialize;

use tw_core::types::Timestamp;

/// One exchange server-time probe.
///
/// `server_time` has already been moved forward by `network_latency`, so it
/// estimates the exchange clock at `local_time_at_capture`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeOffsetSample {
    pub exchange: String,
    pub server_time: Timestamp,
    pub local_time_at_capture: Timestamp,
    /// Half the round trip, assuming a symmetric path.
    pub network_latency: Duration,
    pub round_trip: Duration,
}

impl TimeOffsetSample {
    /// Build a sample from a raw server time and the local send/receive times.
    pub fn from_round_trip(
        exchange: impl Into<String>,
        server_time_ms: u64,
        sent_at: Timestamp,
        received_at: Timestamp,
    ) -> Self {
        let round_trip = received_at.elapsed_since(&sent_at);
        let network_latency = round_trip / 2;
        Self {
            exchange: exchange.into(),
            server_time: Timestamp::from_millis(server_time_ms).add_duration(network_latency),
            local_time_at_capture: received_at,
            network_latency,
            round_trip,
        }
    }

    /// Exchange clock minus local clock, in milliseconds.
    pub fn offset_ms(&self) -> i64 {
        self.server_time.signed_millis_since(&self.local_time_at_capture)
    }
}

/// Latest synchronization state for one exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExchangeTimeInfo {
    pub exchange: String,
    pub offset_ms: i64,
    /// Offset before the latest sample, for drift growth.
    pub previous_offset_ms: Option<i64>,
    pub server_time: Timestamp,
    pub network_latency: Duration,
    pub last_sync_at: Timestamp,
    pub sync_count: u64,
}

/// Result of one SNTP exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NtpMeasurement {
    pub server: String,
    /// NTP time minus local time.
    pub offset_ms: i64,
    pub round_trip: Duration,
}

/// An exchange whose clock is further from ours than allowed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftWarning {
    pub exchange: String,
    pub drift_ms: i64,
    pub max_drift_ms: u64,
}

/// Snapshot of the sync service for dashboards and health endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClockStats {
    pub healthy: bool,
    pub running: bool,
    pub sync_count: u64,
    pub error_count: u64,
    pub last_sync_at: Option<Timestamp>,
    pub ntp_offset_ms: i64,
    pub exchanges: Vec<ExchangeTimeInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_latency_is_half_round_trip() {
        let sent = Timestamp::from_millis(10_000);
        let received = Timestamp::from_millis(10_080);
        let sample = TimeOffsetSample::from_round_trip("bybit", 10_540, sent, received);
        assert_eq!(sample.round_trip, Duration::from_millis(80));
        assert_eq!(sample.network_latency, Duration::from_millis(40));
        assert_eq!(sample.server_time, Timestamp::from_millis(10_580));
        assert_eq!(sample.local_time_at_capture, received);
        assert_eq!(sample.offset_ms(), 500);
    }

    #[test]
    fn test_negative_offset() {
        let sent = Timestamp::from_millis(50_000);
        let received = Timestamp::from_millis(50_010);
        let sample = TimeOffsetSample::from_round_trip("bybit", 49_000, sent, received);
        assert_eq!(sample.offset_ms(), -1_005);
    }

    proptest! {
        #[test]
        fn symmetric_path_recovers_true_offset(
            local_ms in 1_600_000_000_000u64..1_900_000_000_000,
            offset_ms in -5_000i64..5_000,
            one_way_ms in 0u64..2_000,
        ) {
            // Server stamps its clock halfway through a symmetric round trip.
            let sent = Timestamp::from_millis(local_ms);
            let received = Timestamp::from_millis(local_ms + 2 * one_way_ms);
            let server_ms = (local_ms as i64 + one_way_ms as i64 + offset_ms) as u64;
            let sample = TimeOffsetSample::from_round_trip("x", server_ms, sent, received);
            prop_assert_eq!(sample.offset_ms(), offset_ms);
        }
    }
}
