//! Bybit v5 public WebSocket wire types.
//!
//! These map directly onto the JSON Bybit sends. Numeric fields arrive as
//! strings (sometimes numbers, sometimes absent in deltas), so every numeric
//! field goes through a lenient deserializer that yields `0` instead of
//! failing.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Top-level envelope shared by acks, pongs and data frames.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BybitWsResponse {
    /// Topic name (e.g. "orderbook.50.BTCUSDT").
    pub topic: Option<String>,
    /// "snapshot" or "delta".
    #[serde(rename = "type")]
    pub msg_type: Option<String>,
    /// Operation echoed in acks and pongs.
    pub op: Option<String>,
    /// Present on subscribe/unsubscribe/ping acknowledgements.
    pub success: Option<bool>,
    /// Human-readable status of an ack ("pong" for ping replies).
    pub ret_msg: Option<String>,
    /// Server-side connection id.
    pub conn_id: Option<String>,
    /// Message payload (object or array depending on topic).
    pub data: Option<Value>,
    /// Server timestamp in milliseconds.
    #[serde(default, deserialize_with = "lenient_opt_u64")]
    pub ts: Option<u64>,
}

/// `tickers.{symbol}` payload. Deltas carry only the fields that changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitTicker {
    #[serde(default)]
    pub symbol: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub last_price: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub high_price24h: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub low_price24h: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub volume24h: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub turnover24h: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price24h_pcnt: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub bid1_price: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub bid1_size: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub ask1_price: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub ask1_size: f64,
}

/// One `publicTrade.{symbol}` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BybitTrade {
    /// Trade timestamp in milliseconds.
    #[serde(rename = "T", default, deserialize_with = "lenient_u64")]
    pub timestamp: u64,
    /// Symbol name.
    #[serde(default)]
    pub s: String,
    /// Side: "Buy" or "Sell".
    #[serde(rename = "S", default)]
    pub side: String,
    /// Quantity.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub v: f64,
    /// Price.
    #[serde(default, deserialize_with = "lenient_f64")]
    pub p: f64,
    /// Trade ID.
    #[serde(default)]
    pub i: String,
}

/// `orderbook.{depth}.{symbol}` payload (snapshot or delta).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BybitOrderbook {
    #[serde(default)]
    pub s: String,
    /// Bid levels as `[price, qty]` pairs.
    #[serde(default)]
    pub b: Vec<Vec<Value>>,
    /// Ask levels as `[price, qty]` pairs.
    #[serde(default)]
    pub a: Vec<Vec<Value>>,
    /// Update ID.
    #[serde(default, deserialize_with = "lenient_u64")]
    pub u: u64,
    /// Cross-sequence number.
    #[serde(default, deserialize_with = "lenient_u64")]
    pub seq: u64,
}

/// One `kline.{interval}.{symbol}` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BybitKline {
    #[serde(default, deserialize_with = "lenient_u64")]
    pub start: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub end: u64,
    #[serde(default)]
    pub interval: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub open: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub close: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub high: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub low: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub volume: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub turnover: f64,
    #[serde(default)]
    pub confirm: bool,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub timestamp: u64,
}

/// Subscribe / unsubscribe request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BybitSubscribeRequest {
    /// "subscribe" or "unsubscribe".
    pub op: String,
    /// Topic strings.
    pub args: Vec<String>,
}

impl BybitSubscribeRequest {
    pub fn subscribe(topics: Vec<String>) -> Self {
        Self {
            op: "subscribe".to_string(),
            args: topics,
        }
    }

    pub fn unsubscribe(topics: Vec<String>) -> Self {
        Self {
            op: "unsubscribe".to_string(),
            args: topics,
        }
    }

    /// Serialize to the text frame sent on the socket.
    pub fn to_frame(&self) -> String {
        // A struct of strings always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Application-level keep-alive frame.
pub const PING_FRAME: &str = r#"{"op":"ping"}"#;

/// Coerce a JSON value to a finite `f64`, `0.0` when absent or unparseable.
/// `"NaN"` and `"inf"` parse as floats but are rejected.
pub fn value_to_f64(value: &Value) -> f64 {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite()).unwrap_or(0.0)
}

/// Coerce a JSON value to `u64`, `0` when absent or unparseable.
pub fn value_to_u64(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value_to_f64(&value))
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value_to_u64(&value))
}

fn lenient_opt_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => None,
        other => Some(value_to_u64(&other)),
    })
}
