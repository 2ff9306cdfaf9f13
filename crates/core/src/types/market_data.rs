//! Canonical market data events.
//!
//! Exchange-specific normalizers convert wire frames into these structures.
//! Prices and quantities are plain `f64`: downstream consumers display and
//! store them, they never do exact arithmetic on them here.

use serde::{Deserialize, Serialize};

use super::timestamp::Timestamp;

/// Taker side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Parse an exchange side string. Anything that is not a buy is a sell.
    pub fn from_wire(s: &str) -> Self {
        if s.eq_ignore_ascii_case("buy") {
            Side::Buy
        } else {
            Side::Sell
        }
    }
}

/// 24h ticker statistics for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub exchange: String,
    pub symbol: String,
    pub last_price: f64,
    pub bid_price: f64,
    pub bid_size: f64,
    pub ask_price: f64,
    pub ask_size: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub volume_24h: f64,
    pub turnover_24h: f64,
    /// Fractional change over 24h (`0.01` = +1%).
    pub price_change_24h: f64,
    /// Exchange timestamp of the frame.
    pub exchange_time: Timestamp,
    /// Synchronized local time at which the frame was received.
    pub received_at: Timestamp,
}

/// Individual public trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub exchange: String,
    pub symbol: String,
    pub trade_id: String,
    pub price: f64,
    pub quantity: f64,
    /// Taker side (the aggressor).
    pub side: Side,
    /// Exchange execution time.
    pub timestamp: Timestamp,
    pub received_at: Timestamp,
}

/// A single price level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    /// Aggregate quantity. Zero in a delta means the level was removed.
    pub quantity: f64,
}

/// L2 order book snapshot or incremental delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookUpdate {
    pub exchange: String,
    pub symbol: String,
    /// Depth of the subscribed book stream (e.g. 50).
    pub depth: u32,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    /// `true` for a full snapshot, `false` for a delta.
    pub is_snapshot: bool,
    pub update_id: u64,
    pub seq: u64,
    pub exchange_time: Timestamp,
    pub received_at: Timestamp,
}

/// OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub exchange: String,
    pub symbol: String,
    /// Exchange interval label (`1`, `5`, `60`, `D`, ...).
    pub interval: String,
    pub start: Timestamp,
    pub end: Timestamp,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub turnover: f64,
    /// Whether the candle is closed.
    pub confirmed: bool,
    pub received_at: Timestamp,
}

/// Any canonical market data event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarketEvent {
    Ticker(Ticker),
    Trade(Trade),
    OrderBook(OrderBookUpdate),
    Kline(Kline),
}

impl MarketEvent {
    /// Symbol the event refers to.
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Ticker(t) => &t.symbol,
            MarketEvent::Trade(t) => &t.symbol,
            MarketEvent::OrderBook(b) => &b.symbol,
            MarketEvent::Kline(k) => &k.symbol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_from_wire() {
        assert_eq!(Side::from_wire("Buy"), Side::Buy);
        assert_eq!(Side::from_wire("BUY"), Side::Buy);
        assert_eq!(Side::from_wire("Sell"), Side::Sell);
        assert_eq!(Side::from_wire(""), Side::Sell);
    }

    #[test]
    fn test_market_event_symbol() {
        let trade = Trade {
            exchange: "bybit".to_string(),
            symbol: "BTCUSDT".to_string(),
            trade_id: "t-1".to_string(),
            price: 65000.5,
            quantity: 0.01,
            side: Side::Buy,
            timestamp: Timestamp::from_millis(1706000000000),
            received_at: Timestamp::from_millis(1706000000005),
        };
        assert_eq!(MarketEvent::Trade(trade).symbol(), "BTCUSDT");
    }

    #[test]
    fn test_book_update_serializes() {
        let update = OrderBookUpdate {
            exchange: "bybit".to_string(),
            symbol: "ETHUSDT".to_string(),
            depth: 50,
            bids: vec![BookLevel { price: 3500.0, quantity: 0.0 }],
            asks: vec![],
            is_snapshot: false,
            update_id: 7,
            seq: 70,
            exchange_time: Timestamp::from_millis(1),
            received_at: Timestamp::from_millis(2),
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["depth"], 50);
        assert_eq!(json["bids"][0]["quantity"], 0.0);
    }
}
