//! Tracing setup for the feed processes.
//!
//! [`init_tracing`] installs a global subscriber driven by [`LoggingConfig`]:
//! JSON lines with nanosecond UTC timestamps for log shipping, or pretty
//! colored output while developing. `RUST_LOG` wins over the configured level
//! (e.g. `RUST_LOG=tw_market_data=debug,tw_clock=trace`).
//!
//! The [`CredentialGuard`] layer raises a warning whenever an event or span
//! records a field that looks like an exchange credential, so such values are
//! caught before they end up in a log pipeline.

use std::fmt;

use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// Returns an error instead of panicking when a subscriber is already set,
/// which happens when several tests or embedders initialize logging.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(CredentialGuard);

    if config.json {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(UtcNanos)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE);

        registry.with(json_layer).try_init()?;
    } else {
        let pretty_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(false);

        registry.with(pretty_layer).try_init()?;
    }
    Ok(())
}

/// RFC 3339 UTC timer with nanosecond precision.
#[derive(Debug, Clone)]
struct UtcNanos;

impl tracing_subscriber::fmt::time::FormatTime for UtcNanos {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let now = chrono::Utc::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.9fZ"))
    }
}

/// Layer that flags credential-looking fields.
///
/// Detects fields named like credentials (`api_key`, `secret`, `signature`,
/// ...) and long high-entropy base64 or hex values.
#[derive(Debug, Clone)]
pub struct CredentialGuard;

impl<S> Layer<S> for CredentialGuard
where
    S: tracing::Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_new_span(
        &self,
        attrs: &span::Attributes<'_>,
        _id: &span::Id,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = CredentialVisitor::default();
        attrs.record(&mut visitor);
        if let Some(field) = visitor.flagged {
            tracing::warn!(field, "span records a credential-like field");
        }
    }

    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Our own warning must not re-trigger the check.
        if event.metadata().target() == module_path!() {
            return;
        }
        let mut visitor = CredentialVisitor::default();
        event.record(&mut visitor);
        if let Some(field) = visitor.flagged {
            tracing::warn!(field, "log event records a credential-like field");
        }
    }
}

/// Field names that always indicate credentials regardless of value.
const CREDENTIAL_FIELD_NAMES: &[&str] = &[
    "api_key",
    "api_secret",
    "secret",
    "secret_key",
    "private_key",
    "password",
    "token",
    "signature",
];

#[derive(Default)]
struct CredentialVisitor {
    flagged: Option<&'static str>,
}

impl CredentialVisitor {
    /// Whether a value looks like an exchange key or HMAC signature.
    fn looks_like_credential(value: &str) -> bool {
        if value.len() < 32 || value.contains(char::is_whitespace) {
            return false;
        }
        let hex_like = value.len() >= 40 && value.chars().all(|c| c.is_ascii_hexdigit());
        let base64_like = value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=');
        let has_digit = value.chars().any(|c| c.is_ascii_digit());
        let has_alpha = value.chars().any(|c| c.is_ascii_alphabetic());
        hex_like || (base64_like && has_digit && has_alpha)
    }
}

impl Visit for CredentialVisitor {
    fn record_debug(&mut self, field: &Field, _value: &dyn fmt::Debug) {
        if CREDENTIAL_FIELD_NAMES.contains(&field.name()) {
            self.flagged = Some(field.name());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if CREDENTIAL_FIELD_NAMES.contains(&field.name()) || Self::looks_like_credential(value) {
            self.flagged = Some(field.name());
        }
    }
}
