//! Minimal SNTP client (RFC 4330, client mode).
//!
//! One 48-byte request per query, servers tried in order until one answers.
//! The offset and round-trip follow the usual four-timestamp formulas:
//!
//! ```text
//! offset     = ((t2 - t1) + (t3 - t4)) / 2
//! round_trip = (t4 - t1) - (t3 - t2)
//! ```

use std::time::Duration;

use tokio::net::UdpSocket;

use tw_core::clock::Clock;
use tw_core::types::Timestamp;

use crate::error::ClockError;
use crate::sample::NtpMeasurement;

pub const NTP_PACKET_LEN: usize = 48;

/// Seconds between 1900-01-01 (NTP era 0) and 1970-01-01.
const NTP_UNIX_EPOCH_DELTA: u64 = 2_208_988_800;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// LI = 0, VN = 3, Mode = 3 (client).
const CLIENT_HEADER: u8 = 0x1B;
const MODE_SERVER: u8 = 4;

const ORIGINATE_OFFSET: usize = 24;
const RECEIVE_OFFSET: usize = 32;
const TRANSMIT_OFFSET: usize = 40;

/// SNTP client over UDP.
#[derive(Debug, Clone)]
pub struct SntpClient {
    servers: Vec<String>,
    timeout: Duration,
}

impl SntpClient {
    /// `servers` are `host:port` strings, tried in order.
    pub fn new(servers: Vec<String>, timeout: Duration) -> Self {
        Self { servers, timeout }
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Measure `local` against the first server that answers.
    pub async fn query(&self, local: &dyn Clock) -> Result<NtpMeasurement, ClockError> {
        let mut last_error = ClockError::Ntp("no servers configured".to_string());
        for server in &self.servers {
            match self.query_server(server, local).await {
                Ok(measurement) => return Ok(measurement),
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "NTP server did not answer");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn query_server(&self, server: &str, local: &dyn Clock) -> Result<NtpMeasurement, ClockError> {
        let exchange = async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(server).await?;
            let t1 = local.now();
            socket.send(&request_packet(t1)).await?;
            let mut buf = [0u8; 128];
            let len = socket.recv(&mut buf).await?;
            let t4 = local.now();
            Ok::<_, std::io::Error>((buf, len, t1, t4))
        };

        let (buf, len, t1, t4) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                ClockError::Ntp(format!(
                    "{server}: timed out after {} ms",
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| ClockError::Ntp(format!("{server}: {e}")))?;

        parse_response(server, &buf[..len], t1, t4)
    }
}

/// Build a client request carrying `t1` as its transmit timestamp.
pub fn request_packet(t1: Timestamp) -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = CLIENT_HEADER;
    packet[TRANSMIT_OFFSET..TRANSMIT_OFFSET + 8].copy_from_slice(&to_ntp(t1).to_be_bytes());
    packet
}

/// Validate a server reply and compute the measurement.
///
/// `t1` must be the timestamp that went into [`request_packet`]; the server
/// echoes it back as the originate timestamp.
pub fn parse_response(
    server: &str,
    packet: &[u8],
    t1: Timestamp,
    t4: Timestamp,
) -> Result<NtpMeasurement, ClockError> {
    let fail = |reason: &str| ClockError::Ntp(format!("{server}: {reason}"));

    if packet.len() < NTP_PACKET_LEN {
        return Err(fail("short packet"));
    }
    if packet[0] & 0x07 != MODE_SERVER {
        return Err(fail("reply is not in server mode"));
    }
    if packet[1] == 0 {
        return Err(fail("kiss-o'-death (stratum 0)"));
    }
    if read_u64(packet, ORIGINATE_OFFSET) != to_ntp(t1) {
        return Err(fail("originate timestamp does not match request"));
    }
    let transmit = read_u64(packet, TRANSMIT_OFFSET);
    if transmit == 0 {
        return Err(fail("zero transmit timestamp"));
    }

    let t1 = t1.as_nanos() as i128;
    let t2 = from_ntp(read_u64(packet, RECEIVE_OFFSET));
    let t3 = from_ntp(transmit);
    let t4 = t4.as_nanos() as i128;

    let offset_ns = ((t2 - t1) + (t3 - t4)) / 2;
    let round_trip_ns = ((t4 - t1) - (t3 - t2)).max(0);

    Ok(NtpMeasurement {
        server: server.to_string(),
        offset_ms: round_to_millis(offset_ns),
        round_trip: Duration::from_nanos(round_trip_ns.min(u64::MAX as i128) as u64),
    })
}

/// Nearest millisecond; fixed-point conversion can leave a nanosecond of
/// error either way.
fn round_to_millis(nanos: i128) -> i64 {
    let half = if nanos < 0 { -500_000 } else { 500_000 };
    ((nanos + half) / 1_000_000) as i64
}

fn read_u64(packet: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&packet[at..at + 8]);
    u64::from_be_bytes(bytes)
}

/// Unix nanoseconds to 32.32 fixed-point NTP time.
pub fn to_ntp(ts: Timestamp) -> u64 {
    let nanos = ts.as_nanos();
    let secs = nanos / NANOS_PER_SEC + NTP_UNIX_EPOCH_DELTA;
    let frac = ((nanos % NANOS_PER_SEC) << 32) / NANOS_PER_SEC;
    (secs << 32) | frac
}

/// 32.32 fixed-point NTP time to signed Unix nanoseconds.
pub fn from_ntp(value: u64) -> i128 {
    let secs = (value >> 32) as i128 - NTP_UNIX_EPOCH_DELTA as i128;
    let frac = ((value & 0xFFFF_FFFF) as i128 * NANOS_PER_SEC as i128) >> 32;
    secs * NANOS_PER_SEC as i128 + frac
}
