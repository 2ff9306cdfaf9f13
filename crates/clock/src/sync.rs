//! Clock synchronization service.
//!
//! Keeps one NTP offset (an `AtomicI64`, read lock-free on every timestamp)
//! and one offset sample per exchange (a `DashMap`). The trading timestamp
//! is the local wall clock corrected by the NTP offset; exchange timestamps
//! add that exchange's latest offset on top.
//!
//! Health is a plain function of the bookkeeping: unhealthy until the first
//! successful sync, when the last success is older than
//! `stale_sync_multiple * sync_interval`, or once the cumulative error count
//! reaches the threshold. Drift is advisory and never fails anything.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use tw_core::clock::Clock;
use tw_core::config::ClockConfig;
use tw_core::types::Timestamp;

use crate::error::ClockError;
use crate::event::ClockEvent;
use crate::ntp::SntpClient;
use crate::prober::ServerTimeSource;
use crate::sample::{ClockStats, DriftWarning, ExchangeTimeInfo, NtpMeasurement, TimeOffsetSample};

/// Error source name used for NTP failures.
pub const NTP_SOURCE: &str = "ntp";

#[derive(Debug, Default)]
struct HealthState {
    /// Raw local time of the latest successful sync.
    last_sync_at: Option<Timestamp>,
    sync_count: u64,
    error_count: u64,
    /// Last reported health, for transition events.
    healthy: bool,
}

#[derive(Default)]
struct Runtime {
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

/// Trusted time for the whole process.
pub struct ClockSyncService {
    config: ClockConfig,
    local: Arc<dyn Clock>,
    ntp_offset_ms: AtomicI64,
    samples: DashMap<String, ExchangeTimeInfo>,
    health: RwLock<HealthState>,
    events: mpsc::UnboundedSender<ClockEvent>,
    runtime: Mutex<Runtime>,
}

impl ClockSyncService {
    /// Create the service on top of a raw local clock.
    pub fn new(
        config: ClockConfig,
        local: Arc<dyn Clock>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ClockEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            config,
            local,
            ntp_offset_ms: AtomicI64::new(0),
            samples: DashMap::new(),
            health: RwLock::new(HealthState::default()),
            events,
            runtime: Mutex::new(Runtime::default()),
        });
        (service, rx)
    }

    fn emit(&self, event: ClockEvent) {
        let _ = self.events.send(event);
    }

    /// Local wall clock corrected by the NTP offset.
    pub fn now(&self) -> Timestamp {
        self.local
            .now()
            .offset_by_millis(self.ntp_offset_ms.load(Ordering::Acquire))
    }

    /// [`Self::now`] moved onto `exchange`'s clock, or plain `now()` before
    /// the first sample for it.
    pub fn exchange_time(&self, exchange: &str) -> Timestamp {
        let now = self.now();
        match self.samples.get(exchange) {
            Some(info) => now.offset_by_millis(info.offset_ms),
            None => now,
        }
    }

    /// Milliseconds for timestamp fields sent to exchanges.
    pub fn trading_timestamp(&self) -> u64 {
        self.now().to_millis()
    }

    pub fn exchange_trading_timestamp(&self, exchange: &str) -> u64 {
        self.exchange_time(exchange).to_millis()
    }

    pub fn ntp_offset_ms(&self) -> i64 {
        self.ntp_offset_ms.load(Ordering::Acquire)
    }

    /// Record a successful exchange probe.
    pub fn sync_with_exchange(&self, sample: TimeOffsetSample) {
        let offset_ms = sample.server_time.signed_millis_since(&sample.local_time_at_capture);
        let synced_at = self.local.now();

        let previous = self.samples.get(&sample.exchange).map(|i| (i.offset_ms, i.sync_count));
        let info = ExchangeTimeInfo {
            exchange: sample.exchange.clone(),
            offset_ms,
            previous_offset_ms: previous.map(|(offset, _)| offset),
            server_time: sample.server_time,
            network_latency: sample.network_latency,
            last_sync_at: synced_at,
            sync_count: previous.map(|(_, count)| count).unwrap_or(0) + 1,
        };
        self.samples.insert(sample.exchange.clone(), info);

        if let Some((previous_offset, _)) = previous {
            let growth = offset_ms - previous_offset;
            if growth.unsigned_abs() > self.config.max_drift_ms {
                tracing::warn!(
                    exchange = %sample.exchange,
                    previous_offset_ms = previous_offset,
                    offset_ms,
                    growth_ms = growth,
                    "exchange clock offset jumped"
                );
            }
        }

        let sync_count = {
            let mut health = self.health.write();
            health.sync_count += 1;
            health.last_sync_at = Some(synced_at);
            health.sync_count
        };

        tracing::debug!(
            exchange = %sample.exchange,
            offset_ms,
            latency_us = sample.network_latency.as_micros() as u64,
            sync_count,
            "exchange time synchronized"
        );
        self.emit(ClockEvent::Sync {
            exchange: sample.exchange,
            server_time: sample.server_time,
            network_latency: sample.network_latency,
            sync_count,
        });
        self.evaluate_health();
    }

    /// Record a failed probe or NTP query. `source` is the exchange name or
    /// [`NTP_SOURCE`].
    pub fn record_sync_error(&self, source: &str, error: &ClockError) {
        let error_count = {
            let mut health = self.health.write();
            health.error_count += 1;
            health.error_count
        };
        tracing::warn!(source, error = %error, error_count, "clock sync failed");
        self.emit(ClockEvent::SyncError {
            source: source.to_string(),
            message: error.to_string(),
        });
        self.evaluate_health();
    }

    /// Adopt a new NTP offset for the local clock.
    pub fn apply_ntp_measurement(&self, measurement: &NtpMeasurement) {
        self.ntp_offset_ms
            .store(measurement.offset_ms, Ordering::Release);
        {
            let mut health = self.health.write();
            health.sync_count += 1;
            health.last_sync_at = Some(self.local.now());
        }

        if measurement.offset_ms.unsigned_abs() > self.config.max_drift_ms {
            tracing::warn!(
                server = %measurement.server,
                offset_ms = measurement.offset_ms,
                max_drift_ms = self.config.max_drift_ms,
                "local clock is far from NTP time"
            );
        } else {
            tracing::debug!(
                server = %measurement.server,
                offset_ms = measurement.offset_ms,
                round_trip_us = measurement.round_trip.as_micros() as u64,
                "NTP offset updated"
            );
        }
        self.emit(ClockEvent::NtpSync {
            server: measurement.server.clone(),
            offset_ms: measurement.offset_ms,
            round_trip: measurement.round_trip,
        });
        self.evaluate_health();
    }

    /// Whether `timestamp_ms` is within `max_age_ms` of the trading
    /// timestamp, in either direction. The boundary is accepted.
    pub fn validate_timestamp(&self, timestamp_ms: u64, max_age_ms: u64) -> bool {
        let now = self.trading_timestamp();
        now.abs_diff(timestamp_ms) <= max_age_ms
    }

    pub fn is_healthy(&self) -> bool {
        self.compute_health(&self.health.read())
    }

    fn compute_health(&self, health: &HealthState) -> bool {
        let Some(last_sync_at) = health.last_sync_at else {
            return false;
        };
        if self.local.now().elapsed_since(&last_sync_at) > self.config.stale_after() {
            return false;
        }
        health.error_count < self.config.error_threshold
    }

    /// Recompute health and report a transition.
    fn evaluate_health(&self) -> bool {
        let mut health = self.health.write();
        let healthy = self.compute_health(&health);
        if healthy != health.healthy {
            health.healthy = healthy;
            drop(health);
            if healthy {
                tracing::info!("clock synchronization healthy");
            } else {
                tracing::warn!("clock synchronization unhealthy");
            }
            self.emit(ClockEvent::HealthChanged { healthy });
        }
        healthy
    }

    /// Report every exchange whose offset exceeds the drift limit and
    /// refresh the health state.
    pub fn check_exchange_time_health(&self) -> Vec<DriftWarning> {
        let mut warnings: Vec<DriftWarning> = self
            .samples
            .iter()
            .filter(|entry| entry.offset_ms.unsigned_abs() > self.config.max_drift_ms)
            .map(|entry| DriftWarning {
                exchange: entry.exchange.clone(),
                drift_ms: entry.offset_ms,
                max_drift_ms: self.config.max_drift_ms,
            })
            .collect();
        warnings.sort_by(|a, b| a.exchange.cmp(&b.exchange));

        for warning in &warnings {
            tracing::warn!(
                exchange = %warning.exchange,
                drift_ms = warning.drift_ms,
                max_drift_ms = warning.max_drift_ms,
                "exchange clock drift above limit"
            );
            self.emit(ClockEvent::DriftWarning(warning.clone()));
        }
        self.evaluate_health();
        warnings
    }

    pub fn exchange_time_info(&self, exchange: &str) -> Option<ExchangeTimeInfo> {
        self.samples.get(exchange).map(|info| info.clone())
    }

    /// All per-exchange states, sorted by exchange name.
    pub fn exchange_time_infos(&self) -> Vec<ExchangeTimeInfo> {
        let mut infos: Vec<ExchangeTimeInfo> =
            self.samples.iter().map(|entry| entry.value().clone()).collect();
        infos.sort_by(|a, b| a.exchange.cmp(&b.exchange));
        infos
    }

    pub fn stats(&self) -> ClockStats {
        let health = self.health.read();
        ClockStats {
            healthy: self.compute_health(&health),
            running: self.is_running(),
            sync_count: health.sync_count,
            error_count: health.error_count,
            last_sync_at: health.last_sync_at,
            ntp_offset_ms: self.ntp_offset_ms(),
            exchanges: self.exchange_time_infos(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().cancel.is_some()
    }

    /// Spawn the background loops: one per exchange source, one for NTP when
    /// a client is given, and the health check.
    ///
    /// Returns `false` without doing anything if already running.
    pub fn start(
        self: &Arc<Self>,
        sources: Vec<Arc<dyn ServerTimeSource>>,
        ntp: Option<SntpClient>,
    ) -> bool {
        let mut runtime = self.runtime.lock();
        if runtime.cancel.is_some() {
            tracing::warn!("clock sync already running");
            return false;
        }

        let cancel = CancellationToken::new();
        for source in sources {
            tracing::info!(exchange = %source.exchange(), "starting exchange time sync");
            runtime.tasks.push(tokio::spawn(
                Arc::clone(self).run_exchange_sync(source, cancel.clone()),
            ));
        }
        if let Some(client) = ntp {
            tracing::info!(servers = ?client.servers(), "starting NTP sync");
            runtime
                .tasks
                .push(tokio::spawn(Arc::clone(self).run_ntp_sync(client, cancel.clone())));
        }
        runtime
            .tasks
            .push(tokio::spawn(Arc::clone(self).run_health_check(cancel.clone())));
        runtime.cancel = Some(cancel);
        true
    }

    /// Stop every background loop. Returns `false` if nothing was running.
    pub fn stop(&self) -> bool {
        let mut runtime = self.runtime.lock();
        let Some(cancel) = runtime.cancel.take() else {
            return false;
        };
        cancel.cancel();
        for task in runtime.tasks.drain(..) {
            task.abort();
        }
        tracing::info!("clock sync stopped");
        true
    }

    /// Probes run back to back on one task, so at most one request per
    /// exchange is ever in flight.
    async fn run_exchange_sync(
        self: Arc<Self>,
        source: Arc<dyn ServerTimeSource>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let clock: &dyn Clock = self.as_ref();
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = source.fetch_exchange_time(clock) => result,
            };
            match result {
                Ok(sample) => self.sync_with_exchange(sample),
                Err(e) => self.record_sync_error(source.exchange(), &e),
            }
        }
    }

    async fn run_ntp_sync(self: Arc<Self>, client: SntpClient, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = client.query(self.local.as_ref()) => result,
            };
            match result {
                Ok(measurement) => self.apply_ntp_measurement(&measurement),
                Err(e) => self.record_sync_error(NTP_SOURCE, &e),
            }
        }
    }

    async fn run_health_check(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.health_check_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_exchange_time_health();
                }
            }
        }
    }
}

impl Clock for ClockSyncService {
    fn now(&self) -> Timestamp {
        ClockSyncService::now(self)
    }
}
