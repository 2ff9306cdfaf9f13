//! Clock synchronization errors.

/// Failures of a single time probe or NTP query.
///
/// None of these are fatal: the sync service counts them, reports a
/// [`crate::ClockEvent::SyncError`] and tries again on the next interval.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// The probe hit its hard deadline and was aborted.
    #[error("request to {url} timed out after {timeout_ms} ms")]
    RequestTimeout { url: String, timeout_ms: u64 },
    /// Any other transport failure (connect, TLS, HTTP status, body read).
    #[error("request to {url} failed: {reason}")]
    Network { url: String, reason: String },
    /// The exchange answered, but not with a usable server time.
    #[error("invalid server time from {exchange}: {reason}")]
    Sync { exchange: String, reason: String },
    /// NTP query failure.
    #[error("ntp: {0}")]
    Ntp(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ClockError::RequestTimeout {
            url: "https://api.bybit.com/v5/market/time".to_string(),
            timeout_ms: 5000,
        };
        assert_eq!(
            err.to_string(),
            "request to https://api.bybit.com/v5/market/time timed out after 5000 ms"
        );

        let err = ClockError::Sync {
            exchange: "bybit".to_string(),
            reason: "retCode 10001".to_string(),
        };
        assert_eq!(err.to_string(), "invalid server time from bybit: retCode 10001");
    }
}
