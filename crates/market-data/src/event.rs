//! Events emitted by a connection manager.

use std::time::Duration;

use tw_core::types::{Kline, MarketEvent, OrderBookUpdate, Ticker, Timestamp, Trade};

/// Everything a [`crate::ConnectionManager`] reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// The socket is open and subscriptions are being re-applied.
    Connected,
    /// The socket closed. `code` is the WebSocket close code (1006 when the
    /// transport died without a close frame).
    Disconnected { code: u16, reason: String },
    /// A connection-level error. The manager handles recovery itself.
    Error { message: String },
    /// A data frame arrived on `topic`. Emitted before the typed events it
    /// produced.
    MarketData { topic: String, received_at: Timestamp },
    Ticker(Ticker),
    Trade(Trade),
    OrderBook(OrderBookUpdate),
    Kline(Kline),
    /// A reconnect attempt has been scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// The reconnect budget is spent; only an explicit `connect()` resumes.
    MaxReconnectAttemptsReached { attempts: u32 },
}

impl From<MarketEvent> for FeedEvent {
    fn from(event: MarketEvent) -> Self {
        match event {
            MarketEvent::Ticker(t) => FeedEvent::Ticker(t),
            MarketEvent::Trade(t) => FeedEvent::Trade(t),
            MarketEvent::OrderBook(b) => FeedEvent::OrderBook(b),
            MarketEvent::Kline(k) => FeedEvent::Kline(k),
        }
    }
}

impl FeedEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedEvent::Connected => "connected",
            FeedEvent::Disconnected { .. } => "disconnected",
            FeedEvent::Error { .. } => "error",
            FeedEvent::MarketData { .. } => "market_data",
            FeedEvent::Ticker(_) => "ticker",
            FeedEvent::Trade(_) => "trade",
            FeedEvent::OrderBook(_) => "orderbook",
            FeedEvent::Kline(_) => "kline",
            FeedEvent::Reconnecting { .. } => "reconnecting",
            FeedEvent::MaxReconnectAttemptsReached { .. } => "max_reconnect_attempts_reached",
        }
    }
}
