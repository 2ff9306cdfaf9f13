//! Bybit frame normalizer.
//!
//! [`normalize`] is a pure function from one raw text frame to either a
//! control frame (pong, subscription ack) or a batch of canonical
//! [`MarketEvent`]s. It never touches the socket; the connection manager
//! decides what to do with the result.

use serde::de::DeserializeOwned;
use serde_json::Value;

use tw_core::types::{
    BookLevel, Kline, MarketEvent, OrderBookUpdate, Side, Ticker, Timestamp, Trade,
};

use crate::error::ParseError;

use super::types::{
    value_to_f64, BybitKline, BybitOrderbook, BybitTicker, BybitTrade, BybitWsResponse,
};

/// Result of normalizing one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedFrame {
    /// Reply to our application-level ping.
    Pong,
    /// Subscribe/unsubscribe acknowledgement.
    Ack {
        op: String,
        success: bool,
        message: String,
    },
    /// A data frame and the events it produced (possibly none, e.g. an empty
    /// trade batch).
    Market {
        topic: String,
        events: Vec<MarketEvent>,
    },
}

/// Which canonical stream a topic maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TopicKind {
    Ticker { symbol: String },
    Trade { symbol: String },
    OrderBook { depth: u32, symbol: String },
    Kline { interval: String, symbol: String },
}

impl TopicKind {
    fn parse(topic: &str) -> Option<Self> {
        let (channel, rest) = topic.split_once('.')?;
        match channel {
            "tickers" | "ticker" => Some(TopicKind::Ticker {
                symbol: rest.to_string(),
            }),
            "publicTrade" | "trade" => Some(TopicKind::Trade {
                symbol: rest.to_string(),
            }),
            "orderbook" => {
                let (depth, symbol) = rest.split_once('.')?;
                Some(TopicKind::OrderBook {
                    depth: depth.parse().unwrap_or(0),
                    symbol: symbol.to_string(),
                })
            }
            "kline" => {
                let (interval, symbol) = rest.split_once('.')?;
                Some(TopicKind::Kline {
                    interval: interval.to_string(),
                    symbol: symbol.to_string(),
                })
            }
            _ => None,
        }
    }
}

/// Normalize one raw Bybit frame.
///
/// `received_at` is stamped onto every produced event; the caller supplies it
/// from its synchronized clock.
pub fn normalize(
    exchange: &str,
    raw: &str,
    received_at: Timestamp,
) -> Result<NormalizedFrame, ParseError> {
    let resp: BybitWsResponse = serde_json::from_str(raw)?;

    if is_pong(&resp) {
        return Ok(NormalizedFrame::Pong);
    }

    if let Some(success) = resp.success {
        return Ok(NormalizedFrame::Ack {
            op: resp.op.unwrap_or_default(),
            success,
            message: resp.ret_msg.unwrap_or_default(),
        });
    }

    let Some(topic) = resp.topic.as_deref() else {
        return Err(ParseError::UnrecognizedShape);
    };
    let kind =
        TopicKind::parse(topic).ok_or_else(|| ParseError::UnknownTopic(topic.to_string()))?;
    let data = resp.data.as_ref().ok_or_else(|| ParseError::InvalidPayload {
        topic: topic.to_string(),
        reason: "missing data".to_string(),
    })?;

    let exchange_time = resp.ts.map(Timestamp::from_millis).unwrap_or(received_at);

    let events = match kind {
        TopicKind::Ticker { symbol } => {
            let t: BybitTicker = decode_object(topic, data)?;
            vec![MarketEvent::Ticker(Ticker {
                exchange: exchange.to_string(),
                symbol: non_empty_or(t.symbol, symbol),
                last_price: t.last_price,
                bid_price: t.bid1_price,
                bid_size: t.bid1_size,
                ask_price: t.ask1_price,
                ask_size: t.ask1_size,
                high_24h: t.high_price24h,
                low_24h: t.low_price24h,
                volume_24h: t.volume24h,
                turnover_24h: t.turnover24h,
                price_change_24h: t.price24h_pcnt,
                exchange_time,
                received_at,
            })]
        }
        TopicKind::Trade { symbol } => {
            let trades: Vec<BybitTrade> = decode_array(topic, data)?;
            trades
                .into_iter()
                .map(|t| {
                    let timestamp = if t.timestamp > 0 {
                        Timestamp::from_millis(t.timestamp)
                    } else {
                        exchange_time
                    };
                    MarketEvent::Trade(Trade {
                        exchange: exchange.to_string(),
                        symbol: non_empty_or(t.s, symbol.clone()),
                        trade_id: t.i,
                        price: t.p,
                        quantity: t.v,
                        side: Side::from_wire(&t.side),
                        timestamp,
                        received_at,
                    })
                })
                .collect()
        }
        TopicKind::OrderBook { depth, symbol } => {
            let ob: BybitOrderbook = decode_object(topic, data)?;
            vec![MarketEvent::OrderBook(OrderBookUpdate {
                exchange: exchange.to_string(),
                symbol: non_empty_or(ob.s, symbol),
                depth,
                bids: levels(&ob.b),
                asks: levels(&ob.a),
                is_snapshot: resp.msg_type.as_deref() == Some("snapshot"),
                update_id: ob.u,
                seq: ob.seq,
                exchange_time,
                received_at,
            })]
        }
        TopicKind::Kline { interval, symbol } => {
            let klines: Vec<BybitKline> = decode_array(topic, data)?;
            klines
                .into_iter()
                .map(|k| {
                    MarketEvent::Kline(Kline {
                        exchange: exchange.to_string(),
                        symbol: symbol.clone(),
                        interval: non_empty_or(k.interval, interval.clone()),
                        start: Timestamp::from_millis(k.start),
                        end: Timestamp::from_millis(k.end),
                        open: k.open,
                        high: k.high,
                        low: k.low,
                        close: k.close,
                        volume: k.volume,
                        turnover: k.turnover,
                        confirmed: k.confirm,
                        received_at,
                    })
                })
                .collect()
        }
    };

    Ok(NormalizedFrame::Market {
        topic: topic.to_string(),
        events,
    })
}

/// Linear public streams answer `{"op":"ping"}` with an ack whose `ret_msg`
/// is "pong"; other Bybit streams reply with `op: "pong"`.
fn is_pong(resp: &BybitWsResponse) -> bool {
    match resp.op.as_deref() {
        Some("pong") => true,
        Some("ping") => resp.ret_msg.as_deref() == Some("pong"),
        _ => false,
    }
}

fn decode_object<T: DeserializeOwned>(topic: &str, data: &Value) -> Result<T, ParseError> {
    if !data.is_object() {
        return Err(ParseError::InvalidPayload {
            topic: topic.to_string(),
            reason: "expected an object".to_string(),
        });
    }
    decode(topic, data)
}

fn decode_array<T: DeserializeOwned>(topic: &str, data: &Value) -> Result<T, ParseError> {
    if !data.is_array() {
        return Err(ParseError::InvalidPayload {
            topic: topic.to_string(),
            reason: "expected an array".to_string(),
        });
    }
    decode(topic, data)
}

fn decode<T: DeserializeOwned>(topic: &str, data: &Value) -> Result<T, ParseError> {
    T::deserialize(data).map_err(|e| ParseError::InvalidPayload {
        topic: topic.to_string(),
        reason: e.to_string(),
    })
}

fn levels(raw: &[Vec<Value>]) -> Vec<BookLevel> {
    raw.iter()
        .map(|level| BookLevel {
            price: level.first().map(value_to_f64).unwrap_or(0.0),
            quantity: level.get(1).map(value_to_f64).unwrap_or(0.0),
        })
        .collect()
}

fn non_empty_or(value: String, fallback: String) -> String {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}
