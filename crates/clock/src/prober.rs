//! Exchange server-time probe.
//!
//! Issues `GET /v5/market/time`, bounded by a hard deadline, and turns the
//! answer into a [`TimeOffsetSample`]. The round trip is treated as
//! symmetric: one-way latency is half of it, and the reported server time is
//! moved forward by that much.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use tw_core::clock::Clock;

use crate::error::ClockError;
use crate::sample::TimeOffsetSample;

/// Bybit v5 server time endpoint.
pub const SERVER_TIME_PATH: &str = "/v5/market/time";

const NANOS_PER_SEC: u64 = 1_000_000_000;
const NANOS_PER_MILLI: u64 = 1_000_000;

/// Latest `timeSecond` accepted (2100-01-01T00:00:00Z).
const MAX_SERVER_SECONDS: u64 = 4_102_444_800;

/// Anything that can report an exchange's current server time.
#[async_trait]
pub trait ServerTimeSource: Send + Sync {
    /// Exchange name used as the sample key.
    fn exchange(&self) -> &str;

    /// Probe once. `clock` stamps the local send and receive times.
    async fn fetch_exchange_time(&self, clock: &dyn Clock) -> Result<TimeOffsetSample, ClockError>;
}

/// Bybit v5 generic response wrapper.
#[derive(Debug, Deserialize)]
struct BybitResponse<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    result: Option<T>,
}

/// `result` of `/v5/market/time`. Both fields arrive as strings, but some
/// gateways send integers.
#[derive(Debug, Deserialize)]
struct ServerTimeResult {
    #[serde(rename = "timeSecond", default)]
    time_second: Value,
    #[serde(rename = "timeNano", default)]
    time_nano: Value,
}

/// REST prober for one exchange.
///
/// Reuses a single `reqwest::Client` for connection pooling.
pub struct ExchangeTimeProber {
    exchange: String,
    url: String,
    timeout: Duration,
    client: Client,
}

impl ExchangeTimeProber {
    pub fn new(exchange: impl Into<String>, rest_url: &str, timeout: Duration) -> Self {
        Self {
            exchange: exchange.into(),
            url: format!("{}{}", rest_url.trim_end_matches('/'), SERVER_TIME_PATH),
            timeout,
            client: Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request_body(&self) -> Result<String, reqwest::Error> {
        self.client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

#[async_trait]
impl ServerTimeSource for ExchangeTimeProber {
    fn exchange(&self) -> &str {
        &self.exchange
    }

    async fn fetch_exchange_time(&self, clock: &dyn Clock) -> Result<TimeOffsetSample, ClockError> {
        let sent_at = clock.now();
        let body = match tokio::time::timeout(self.timeout, self.request_body()).await {
            Err(_elapsed) => {
                return Err(ClockError::RequestTimeout {
                    url: self.url.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
            Ok(Err(e)) => {
                return Err(ClockError::Network {
                    url: self.url.clone(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(body)) => body,
        };
        let received_at = clock.now();

        let server_time_ms = parse_server_time(&self.exchange, &body)?;
        let sample =
            TimeOffsetSample::from_round_trip(&self.exchange, server_time_ms, sent_at, received_at);
        tracing::debug!(
            exchange = %self.exchange,
            server_time_ms,
            round_trip_us = sample.round_trip.as_micros() as u64,
            offset_ms = sample.offset_ms(),
            "server time probed"
        );
        Ok(sample)
    }
}

/// Extract the server time in milliseconds from a `/v5/market/time` body.
pub fn parse_server_time(exchange: &str, body: &str) -> Result<u64, ClockError> {
    let invalid = |reason: String| ClockError::Sync {
        exchange: exchange.to_string(),
        reason,
    };

    let resp: BybitResponse<ServerTimeResult> =
        serde_json::from_str(body).map_err(|e| invalid(format!("malformed body: {e}")))?;
    if resp.ret_code != 0 {
        return Err(invalid(format!("retCode {}: {}", resp.ret_code, resp.ret_msg)));
    }
    let result = resp
        .result
        .ok_or_else(|| invalid("missing result".to_string()))?;

    let seconds = as_u64(&result.time_second)
        .filter(|s| (1..=MAX_SERVER_SECONDS).contains(s))
        .ok_or_else(|| invalid(format!("bad timeSecond {}", result.time_second)))?;
    let nanos = as_u64(&result.time_nano).unwrap_or(0);

    // timeNano is nanoseconds since the epoch; it must agree with timeSecond.
    if nanos >= NANOS_PER_SEC && (nanos / NANOS_PER_SEC).abs_diff(seconds) > 1 {
        return Err(invalid(format!(
            "timeSecond {seconds} and timeNano {nanos} disagree"
        )));
    }

    seconds
        .checked_mul(1000)
        .and_then(|ms| ms.checked_add((nanos % NANOS_PER_SEC) / NANOS_PER_MILLI))
        .ok_or_else(|| invalid(format!("timeSecond {seconds} out of range")))
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_string_fields() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"timeSecond":"1688639403","timeNano":"1688639403423213947"},"retExtInfo":{},"time":1688639403423}"#;
        assert_eq!(parse_server_time("bybit", body).unwrap(), 1_688_639_403_423);
    }

    #[test]
    fn test_parse_integer_fields() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"timeSecond":1688639403,"timeNano":1688639403999000000}}"#;
        assert_eq!(parse_server_time("bybit", body).unwrap(), 1_688_639_403_999);
    }

    #[test]
    fn test_parse_without_nanos() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"timeSecond":"1688639403"}}"#;
        assert_eq!(parse_server_time("bybit", body).unwrap(), 1_688_639_403_000);
    }

    #[test]
    fn test_rejects_error_code() {
        let body = r#"{"retCode":10006,"retMsg":"Too many visits!","result":{}}"#;
        let err = parse_server_time("bybit", body).unwrap_err();
        assert!(matches!(err, ClockError::Sync { .. }));
        assert!(err.to_string().contains("10006"));
    }

    #[test]
    fn test_rejects_missing_result_and_zero_seconds() {
        assert!(matches!(
            parse_server_time("bybit", r#"{"retCode":0,"retMsg":"OK"}"#),
            Err(ClockError::Sync { .. })
        ));
        assert!(matches!(
            parse_server_time("bybit", r#"{"retCode":0,"retMsg":"OK","result":{"timeSecond":"0"}}"#),
            Err(ClockError::Sync { .. })
        ));
        assert!(matches!(
            parse_server_time("bybit", r#"{"retCode":0,"retMsg":"OK","result":{"timeSecond":"abc"}}"#),
            Err(ClockError::Sync { .. })
        ));
    }

    #[test]
    fn test_rejects_inconsistent_fields() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"timeSecond":"1688639403","timeNano":"1588639403423213947"}}"#;
        assert!(matches!(
            parse_server_time("bybit", body),
            Err(ClockError::Sync { .. })
        ));
    }

    #[test]
    fn test_rejects_oversized_seconds() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"timeSecond":"99999999999999999","timeNano":"5"}}"#;
        let err = parse_server_time("bybit", body).unwrap_err();
        assert!(matches!(err, ClockError::Sync { .. }));
        assert!(err.to_string().contains("timeSecond"), "{err}");

        let body = r#"{"retCode":0,"retMsg":"OK","result":{"timeSecond":18446744073709551615}}"#;
        assert!(matches!(
            parse_server_time("bybit", body),
            Err(ClockError::Sync { .. })
        ));
    }

    #[test]
    fn test_rejects_non_json() {
        assert!(matches!(
            parse_server_time("bybit", "<html>bad gateway</html>"),
            Err(ClockError::Sync { .. })
        ));
    }

    #[test]
    fn test_url_joins_path() {
        let p = ExchangeTimeProber::new("bybit", "https://api.bybit.com/", Duration::from_secs(5));
        assert_eq!(p.url(), "https://api.bybit.com/v5/market/time");
        assert_eq!(p.exchange(), "bybit");
    }
}
