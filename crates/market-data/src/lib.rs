//! # tw-market-data
//!
//! Keeps a WebSocket attached to an exchange's public market data feed.
//! The [`connection::ConnectionManager`] owns the socket lifecycle
//! (handshake timeout, heartbeat, exponential-backoff reconnects), the
//! [`subscription::SubscriptionRegistry`] remembers what to re-subscribe
//! after a reconnect, and [`bybit::normalizer`] turns raw frames into the
//! canonical [`tw_core::types::MarketEvent`]s delivered as [`event::FeedEvent`]s.

pub mod bybit;
pub mod connection;
pub mod error;
pub mod event;
pub mod subscription;

pub use connection::{reconnect_delay, ConnectionManager, ConnectionState, ConnectionStats};
pub use error::{FeedError, ParseError};
pub use event::FeedEvent;
pub use subscription::{Subscription, SubscriptionRegistry};
