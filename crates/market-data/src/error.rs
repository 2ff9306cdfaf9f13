//! Error types for the feed.

/// Connection-level failures surfaced by [`crate::ConnectionManager::connect`].
///
/// These never escape the reconnect loop: the manager reports them through
/// [`crate::FeedEvent::Error`] and schedules a retry. Only the caller of an
/// explicit `connect()` sees them as a returned error.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The WebSocket handshake did not finish in time.
    #[error("connection to {url} timed out after {timeout_ms} ms")]
    ConnectionTimeout { url: String, timeout_ms: u64 },
    /// Transport-level failure while opening or using the socket.
    #[error("connection to {url} failed: {reason}")]
    Connection { url: String, reason: String },
    /// `disconnect()` was called while the handshake was in flight.
    #[error("connection attempt cancelled by disconnect")]
    Cancelled,
}

/// A frame that could not be turned into a domain event.
///
/// Always recovered locally: logged, counted and dropped.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The frame is not valid JSON.
    #[error("malformed JSON frame: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// Valid JSON that is neither an ack, a pong nor a data frame.
    #[error("unrecognized frame shape")]
    UnrecognizedShape,
    /// A data frame on a topic this normalizer does not handle.
    #[error("unknown topic {0}")]
    UnknownTopic(String),
    /// The `data` payload does not have the shape the topic requires.
    #[error("invalid payload on {topic}: {reason}")]
    InvalidPayload { topic: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_error_messages() {
        let err = FeedError::ConnectionTimeout {
            url: "wss://example.com".to_string(),
            timeout_ms: 10_000,
        };
        assert_eq!(
            err.to_string(),
            "connection to wss://example.com timed out after 10000 ms"
        );
        assert_eq!(FeedError::Cancelled.to_string(), "connection attempt cancelled by disconnect");
    }

    #[test]
    fn test_parse_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = ParseError::from(serde_err);
        assert!(matches!(err, ParseError::InvalidJson(_)));
        assert!(err.to_string().starts_with("malformed JSON frame"));
    }
}
