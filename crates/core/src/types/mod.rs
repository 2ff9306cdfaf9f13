//! Core types shared by the feed and the clock service.

pub mod market_data;
pub mod timestamp;

// Re-export primary types for convenient access via `tw_core::types::*`.
pub use market_data::{BookLevel, Kline, MarketEvent, OrderBookUpdate, Side, Ticker, Trade};
pub use timestamp::Timestamp;
