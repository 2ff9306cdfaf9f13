//! Layered configuration for the tradewire feed.
//!
//! Configuration is loaded in layers with increasing priority:
//! 1. Compiled-in defaults (Bybit mainnet public endpoints, conservative timers)
//! 2. TOML configuration file (if provided)
//! 3. Environment variable overrides (prefix `TW_`, nested with `__`)
//!
//! The timer values are treated as constants for the lifetime of a process:
//! they are read once at startup and never reloaded.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

// ── Default value functions ────────────────────────────────────────────

fn default_exchange_name() -> String {
    "bybit".to_string()
}

fn default_ws_url() -> String {
    "wss://stream.bybit.com/v5/public/linear".to_string()
}

fn default_rest_url() -> String {
    "https://api.bybit.com".to_string()
}

/// Default WebSocket handshake timeout: 10 000 ms.
fn default_handshake_timeout_ms() -> u64 {
    10_000
}

/// Default heartbeat interval: 20 000 ms (Bybit drops idle sockets after 30 s).
fn default_heartbeat_interval_ms() -> u64 {
    20_000
}

/// Default base reconnect delay: 1 000 ms.
fn default_base_reconnect_delay_ms() -> u64 {
    1_000
}

/// Default maximum consecutive reconnect attempts: 10.
fn default_max_reconnect_attempts() -> u32 {
    10
}

/// Default backoff exponent cap: 5 (delay tops out at 32x the base).
fn default_backoff_exponent_cap() -> u32 {
    5
}

/// Default spacing between re-subscribe frames: 100 ms.
fn default_resubscribe_delay_ms() -> u64 {
    100
}

/// Default wait for the socket task after a manual close: 2 000 ms.
fn default_close_timeout_ms() -> u64 {
    2_000
}

/// Default time-sync interval: 60 000 ms.
fn default_sync_interval_ms() -> u64 {
    60_000
}

/// Default maximum tolerated exchange clock drift: 1 000 ms.
fn default_max_drift_ms() -> u64 {
    1_000
}

/// Default REST time probe timeout: 5 000 ms.
fn default_probe_timeout_ms() -> u64 {
    5_000
}

/// Default staleness window, in sync intervals.
fn default_stale_sync_multiple() -> u32 {
    3
}

/// Default cumulative sync error threshold: 10.
fn default_error_threshold() -> u64 {
    10
}

fn default_ntp_servers() -> Vec<String> {
    vec![
        "pool.ntp.org:123".to_string(),
        "time.google.com:123".to_string(),
        "time.cloudflare.com:123".to_string(),
    ]
}

/// Default NTP query timeout: 3 000 ms.
fn default_ntp_timeout_ms() -> u64 {
    3_000
}

/// Default drift health check interval: 30 000 ms.
fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_subscriptions() -> Vec<SubscriptionConfig> {
    vec![
        SubscriptionConfig {
            channel: "tickers".to_string(),
            symbol: Some("BTCUSDT".to_string()),
        },
        SubscriptionConfig {
            channel: "publicTrade".to_string(),
            symbol: Some("BTCUSDT".to_string()),
        },
    ]
}

// ── Configuration structs ──────────────────────────────────────────────

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Exchange endpoints.
    pub exchange: ExchangeConfig,
    /// WebSocket connection manager timers and reconnect policy.
    pub connection: ConnectionConfig,
    /// Clock synchronization timers and thresholds.
    pub clock: ClockConfig,
    /// Streams subscribed at startup.
    #[serde(default = "default_subscriptions")]
    pub subscriptions: Vec<SubscriptionConfig>,
    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Exchange endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// Exchange identifier used in events and clock samples.
    #[serde(default = "default_exchange_name")]
    pub name: String,
    /// Use testnet endpoints when the URLs are left at their defaults.
    #[serde(default)]
    pub testnet: bool,
    /// Public WebSocket URL.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// REST base URL (used for the server-time probe).
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
}

/// Connection manager configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Maximum time for the WebSocket handshake to complete.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Interval between application-level pings.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Delay before the first reconnect attempt.
    #[serde(default = "default_base_reconnect_delay_ms")]
    pub base_reconnect_delay_ms: u64,
    /// Consecutive failed attempts before reconnection stops.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Largest exponent applied to the base delay.
    #[serde(default = "default_backoff_exponent_cap")]
    pub backoff_exponent_cap: u32,
    /// Spacing between re-subscribe frames after a reconnect.
    #[serde(default = "default_resubscribe_delay_ms")]
    pub resubscribe_delay_ms: u64,
    /// How long `disconnect()` waits for the socket task to finish.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

/// Clock synchronization configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClockConfig {
    /// Interval between exchange time probes and NTP queries.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Exchange offset above which a drift warning is raised.
    #[serde(default = "default_max_drift_ms")]
    pub max_drift_ms: u64,
    /// Hard deadline for one REST time probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// A sync older than this many intervals makes the service unhealthy.
    #[serde(default = "default_stale_sync_multiple")]
    pub stale_sync_multiple: u32,
    /// Cumulative sync errors at which the service reports unhealthy.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u64,
    /// Query NTP servers in addition to the exchange.
    #[serde(default = "default_true")]
    pub ntp_enabled: bool,
    /// NTP servers as `host:port`, tried in order.
    #[serde(default = "default_ntp_servers")]
    pub ntp_servers: Vec<String>,
    /// Timeout for one NTP exchange.
    #[serde(default = "default_ntp_timeout_ms")]
    pub ntp_timeout_ms: u64,
    /// Interval of the drift health check pass.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

/// One stream subscription.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionConfig {
    /// Channel name, e.g. `tickers`, `orderbook.50`, `kline.1`.
    pub channel: String,
    /// Optional symbol scope.
    #[serde(default)]
    pub symbol: Option<String>,
}

/// Log output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of pretty output.
    #[serde(default)]
    pub json: bool,
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            level: default_log_level(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            name: default_exchange_name(),
            testnet: false,
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            base_reconnect_delay_ms: default_base_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            backoff_exponent_cap: default_backoff_exponent_cap(),
            resubscribe_delay_ms: default_resubscribe_delay_ms(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: default_sync_interval_ms(),
            max_drift_ms: default_max_drift_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            stale_sync_multiple: default_stale_sync_multiple(),
            error_threshold: default_error_threshold(),
            ntp_enabled: true,
            ntp_servers: default_ntp_servers(),
            ntp_timeout_ms: default_ntp_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
        }
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn base_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.base_reconnect_delay_ms)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl ClockConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn ntp_timeout(&self) -> Duration {
        Duration::from_millis(self.ntp_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Age after which the last successful sync counts as stale.
    pub fn stale_after(&self) -> Duration {
        self.sync_interval()
            .saturating_mul(self.stale_sync_multiple.max(1))
    }
}

impl AppConfig {
    /// Load configuration using layered sources.
    ///
    /// 1. Compiled-in defaults (Bybit mainnet public endpoints).
    /// 2. TOML file at `config_path` (if `Some`).
    /// 3. Environment variable overrides with prefix `TW_` and `__` as the
    ///    nesting separator (e.g., `TW_CONNECTION__MAX_RECONNECT_ATTEMPTS=20`).
    ///
    /// Testnet endpoints are substituted when `exchange.testnet` is set and
    /// the URLs were left at their mainnet defaults.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut builder = Config::builder()
            // ── Layer 1: compiled-in defaults ───────────────────────
            .set_default("exchange.name", default_exchange_name())?
            .set_default("exchange.testnet", false)?
            .set_default("exchange.ws_url", default_ws_url())?
            .set_default("exchange.rest_url", default_rest_url())?
            .set_default("connection.handshake_timeout_ms", default_handshake_timeout_ms() as i64)?
            .set_default("connection.heartbeat_interval_ms", default_heartbeat_interval_ms() as i64)?
            .set_default("connection.base_reconnect_delay_ms", default_base_reconnect_delay_ms() as i64)?
            .set_default("connection.max_reconnect_attempts", default_max_reconnect_attempts() as i64)?
            .set_default("connection.backoff_exponent_cap", default_backoff_exponent_cap() as i64)?
            .set_default("clock.sync_interval_ms", default_sync_interval_ms() as i64)?
            .set_default("clock.max_drift_ms", default_max_drift_ms() as i64)?
            .set_default("clock.probe_timeout_ms", default_probe_timeout_ms() as i64)?
            .set_default("logging.json", false)?
            .set_default("logging.level", default_log_level())?;

        // ── Layer 2: TOML file ─────────────────────────────────────
        if let Some(path) = config_path {
            let path_str = path
                .to_str()
                .context("config path is not valid UTF-8")?;
            builder = builder.add_source(File::with_name(path_str).required(true));
        }

        // ── Layer 3: env var overrides (TW_ prefix) ────────────────
        // The prefix separator is set explicitly: the `config` crate would
        // otherwise reuse the `__` nesting separator after the prefix.
        builder = builder.add_source(
            Environment::with_prefix("TW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut cfg: AppConfig = builder
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        cfg.apply_testnet_endpoints();
        cfg.validate()?;

        Ok(cfg)
    }

    fn apply_testnet_endpoints(&mut self) {
        if !self.exchange.testnet {
            return;
        }
        if self.exchange.ws_url == default_ws_url() {
            self.exchange.ws_url = "wss://stream-testnet.bybit.com/v5/public/linear".to_string();
        }
        if self.exchange.rest_url == default_rest_url() {
            self.exchange.rest_url = "https://api-testnet.bybit.com".to_string();
        }
    }

    /// Validate configuration invariants.
    fn validate(&self) -> Result<()> {
        if self.exchange.name.trim().is_empty() {
            bail!("exchange.name must not be empty");
        }
        if !(self.exchange.ws_url.starts_with("ws://") || self.exchange.ws_url.starts_with("wss://")) {
            bail!("exchange.ws_url must be a ws:// or wss:// URL, got {}", self.exchange.ws_url);
        }
        if !(self.exchange.rest_url.starts_with("http://")
            || self.exchange.rest_url.starts_with("https://"))
        {
            bail!("exchange.rest_url must be an http(s) URL, got {}", self.exchange.rest_url);
        }

        let conn = &self.connection;
        if conn.handshake_timeout_ms == 0 || conn.heartbeat_interval_ms == 0 {
            bail!("connection timeouts and heartbeat interval must be non-zero");
        }
        if conn.max_reconnect_attempts == 0 {
            bail!("connection.max_reconnect_attempts must be at least 1");
        }
        if conn.backoff_exponent_cap > 16 {
            bail!("connection.backoff_exponent_cap must be at most 16");
        }

        let clock = &self.clock;
        if clock.sync_interval_ms == 0 || clock.probe_timeout_ms == 0 {
            bail!("clock.sync_interval_ms and clock.probe_timeout_ms must be non-zero");
        }
        if clock.health_check_interval_ms == 0 {
            bail!("clock.health_check_interval_ms must be non-zero");
        }
        if clock.error_threshold == 0 || clock.stale_sync_multiple == 0 {
            bail!("clock.error_threshold and clock.stale_sync_multiple must be at least 1");
        }
        if clock.ntp_enabled && clock.ntp_servers.is_empty() {
            bail!("clock.ntp_servers must not be empty when NTP is enabled");
        }

        for sub in &self.subscriptions {
            if sub.channel.trim().is_empty() {
                bail!("subscription channel must not be empty");
            }
        }
        Ok(())
    }
}
