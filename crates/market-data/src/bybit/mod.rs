//! Bybit v5 public WebSocket protocol.
//!
//! Wire types for the linear public streams and the normalizer that turns
//! their frames into canonical market events.

pub mod normalizer;
pub mod types;

pub use normalizer::{normalize, NormalizedFrame};
pub use types::{BybitSubscribeRequest, BybitWsResponse, PING_FRAME};
