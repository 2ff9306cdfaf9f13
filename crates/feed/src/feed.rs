//! Feed runner.
//!
//! Wires the [`ClockSyncService`] and one [`ConnectionManager`] together:
//! the connection stamps arrival times through the synchronized clock, and
//! both event streams are drained into the log until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use tw_clock::{ClockEvent, ClockSyncService, ExchangeTimeProber, ServerTimeSource, SntpClient};
use tw_core::clock::{Clock, SystemClock};
use tw_core::config::{AppConfig, SubscriptionConfig};
use tw_market_data::{ConnectionManager, FeedEvent};

/// Interval between stats lines.
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Run the feed until Ctrl+C.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let (clock, clock_rx) = ClockSyncService::new(config.clock.clone(), Arc::new(SystemClock));

    let prober: Arc<dyn ServerTimeSource> = Arc::new(ExchangeTimeProber::new(
        config.exchange.name.clone(),
        &config.exchange.rest_url,
        config.clock.probe_timeout(),
    ));
    let ntp = config
        .clock
        .ntp_enabled
        .then(|| SntpClient::new(config.clock.ntp_servers.clone(), config.clock.ntp_timeout()));
    clock.start(vec![prober], ntp);

    let trusted: Arc<dyn Clock> = clock.clone();
    let (manager, feed_rx) = ConnectionManager::new(
        config.exchange.name.clone(),
        config.exchange.ws_url.clone(),
        config.connection.clone(),
        trusted,
    );
    apply_subscriptions(&manager, &config.subscriptions);

    // A failed first attempt already scheduled a reconnect.
    if let Err(e) = manager.connect().await {
        tracing::error!(error = %e, "initial connect failed");
    }

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Ctrl+C received, shutting down...");
        shutdown_signal.cancel();
    });

    pump_events(&manager, &clock, feed_rx, clock_rx, shutdown).await;

    manager.disconnect().await;
    clock.stop();
    log_stats(&manager, &clock);
    tracing::info!("feed stopped");
    Ok(())
}

/// Register the configured streams. Duplicates collapse in the registry.
fn apply_subscriptions(manager: &ConnectionManager, subscriptions: &[SubscriptionConfig]) -> usize {
    subscriptions
        .iter()
        .filter(|sub| manager.subscribe(&sub.channel, sub.symbol.as_deref()))
        .count()
}

async fn pump_events(
    manager: &ConnectionManager,
    clock: &ClockSyncService,
    mut feed_rx: UnboundedReceiver<FeedEvent>,
    mut clock_rx: UnboundedReceiver<ClockEvent>,
    shutdown: CancellationToken,
) {
    let mut report = tokio::time::interval_at(
        tokio::time::Instant::now() + REPORT_INTERVAL,
        REPORT_INTERVAL,
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(event) = feed_rx.recv() => log_feed_event(&event),
            Some(event) = clock_rx.recv() => log_clock_event(&event),
            _ = report.tick() => log_stats(manager, clock),
        }
    }
}

fn log_feed_event(event: &FeedEvent) {
    match event {
        FeedEvent::Connected => tracing::info!("feed connected"),
        FeedEvent::Disconnected { code, reason } => {
            tracing::warn!(code, reason = %reason, "feed disconnected")
        }
        FeedEvent::Error { message } => tracing::error!(error = %message, "feed error"),
        FeedEvent::Reconnecting { attempt, delay } => tracing::info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        ),
        FeedEvent::MaxReconnectAttemptsReached { attempts } => {
            tracing::error!(attempts, "reconnect attempts exhausted, feed is down")
        }
        FeedEvent::MarketData { topic, .. } => tracing::trace!(topic = %topic, "frame"),
        FeedEvent::Ticker(t) => tracing::debug!(
            symbol = %t.symbol,
            last = t.last_price,
            bid = t.bid_price,
            ask = t.ask_price,
            "ticker"
        ),
        FeedEvent::Trade(t) => tracing::debug!(
            symbol = %t.symbol,
            price = t.price,
            qty = t.quantity,
            side = ?t.side,
            "trade"
        ),
        FeedEvent::OrderBook(b) => tracing::debug!(
            symbol = %b.symbol,
            snapshot = b.is_snapshot,
            bids = b.bids.len(),
            asks = b.asks.len(),
            update_id = b.update_id,
            "book"
        ),
        FeedEvent::Kline(k) => tracing::debug!(
            symbol = %k.symbol,
            interval = %k.interval,
            close = k.close,
            confirmed = k.confirmed,
            "kline"
        ),
    }
}

fn log_clock_event(event: &ClockEvent) {
    match event {
        ClockEvent::Sync {
            exchange,
            network_latency,
            sync_count,
            ..
        } => tracing::debug!(
            exchange = %exchange,
            latency_us = network_latency.as_micros() as u64,
            sync_count,
            "exchange time synced"
        ),
        ClockEvent::NtpSync {
            server, offset_ms, ..
        } => tracing::debug!(server = %server, offset_ms, "NTP synced"),
        ClockEvent::SyncError { source, message } => {
            tracing::warn!(source = %source, error = %message, "time sync failed")
        }
        ClockEvent::DriftWarning(w) => tracing::warn!(
            exchange = %w.exchange,
            drift_ms = w.drift_ms,
            max_drift_ms = w.max_drift_ms,
            "exchange clock drift"
        ),
        ClockEvent::HealthChanged { healthy } => {
            if *healthy {
                tracing::info!("clock sync healthy");
            } else {
                tracing::warn!("clock sync unhealthy");
            }
        }
    }
}

fn log_stats(manager: &ConnectionManager, clock: &ClockSyncService) {
    let feed = serde_json::to_string(&manager.stats()).unwrap_or_default();
    let time = serde_json::to_string(&clock.stats()).unwrap_or_default();
    tracing::info!(feed = %feed, clock = %time, "stats");
}
