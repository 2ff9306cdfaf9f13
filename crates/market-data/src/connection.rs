//! WebSocket connection manager with automatic reconnection.
//!
//! [`ConnectionManager`] owns exactly one socket to one exchange endpoint and
//! drives the `Disconnected -> Connecting -> Connected -> Closing` state
//! machine. All mutable state lives behind a single `parking_lot::Mutex`
//! that is never held across an `.await`. Every entry point (explicit
//! `connect()`, the reconnect timer, the socket task exiting, `disconnect()`)
//! checks and flips state under that lock, and a generation counter makes
//! callbacks from a superseded socket or timer harmless.
//!
//! Per live connection the manager runs three tasks:
//!
//! - the socket task, which owns both halves of the stream, forwards
//!   outbound frames and feeds inbound text to the normalizer;
//! - the heartbeat, which sends `{"op":"ping"}` on a fixed interval;
//! - the resubscribe task, which replays the registry one topic at a time.
//!
//! Reconnects use `delay(n) = base * 2^min(n - 1, cap)` and stop after
//! `max_reconnect_attempts` consecutive failures.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use tw_core::clock::Clock;
use tw_core::config::ConnectionConfig;
use tw_core::types::Timestamp;

use crate::bybit::{normalize, BybitSubscribeRequest, NormalizedFrame, PING_FRAME};
use crate::error::FeedError;
use crate::event::FeedEvent;
use crate::subscription::{Subscription, SubscriptionRegistry};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Close code reported when the transport died without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code reported when the peer sent a close frame without a code.
const NO_STATUS_RECEIVED: u16 = 1005;
const NORMAL_CLOSURE: u16 = 1000;
const MANUAL_DISCONNECT_REASON: &str = "manual disconnect";

/// Lifecycle state of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Point-in-time counters for one connection manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub subscriptions: usize,
    pub messages_received: u64,
    pub parse_errors: u64,
    pub pings_sent: u64,
    pub pongs_received: u64,
    pub missed_pongs: u64,
    pub last_message_at: Option<Timestamp>,
    pub connected_since: Option<Timestamp>,
    pub connections_opened: u64,
}

/// Backoff delay before reconnect attempt `attempt` (1-based).
///
/// `base * 2^min(attempt - 1, cap_exponent)`, saturating instead of
/// overflowing for absurd configurations.
pub fn reconnect_delay(base: Duration, attempt: u32, cap_exponent: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(cap_exponent);
    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

/// Frames queued for the socket task.
#[derive(Debug)]
enum Outbound {
    Text(String),
    Close,
}

/// Who asked for a connection attempt.
#[derive(Debug, Clone, Copy)]
enum Origin {
    User,
    Reconnect { ticket: u64 },
}

struct ScheduledReconnect {
    ticket: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    state: ConnectionState,
    registry: SubscriptionRegistry,
    reconnect_attempts: u32,
    /// Set once the budget is spent; cleared only by an explicit `connect()`.
    exhausted: bool,
    /// Set by `disconnect()`; suppresses every automatic reconnect.
    manual_close: bool,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    socket_task: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    resubscribe: Option<JoinHandle<()>>,
    reconnect: Option<ScheduledReconnect>,
    reconnect_seq: u64,
    handshake_cancel: Option<CancellationToken>,
    awaiting_pong: bool,
    stats: ConnectionStats,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            registry: SubscriptionRegistry::new(),
            reconnect_attempts: 0,
            exhausted: false,
            manual_close: false,
            generation: 0,
            outbound: None,
            socket_task: None,
            heartbeat: None,
            resubscribe: None,
            reconnect: None,
            reconnect_seq: 0,
            handshake_cancel: None,
            awaiting_pong: false,
            stats: ConnectionStats::default(),
        }
    }

    fn stop_timers(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        if let Some(handle) = self.resubscribe.take() {
            handle.abort();
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(scheduled) = self.reconnect.take() {
            scheduled.handle.abort();
        }
    }

    fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.outbound = None;
        self.awaiting_pong = false;
        self.stats.connected_since = None;
    }
}

struct Shared {
    exchange: String,
    url: String,
    config: ConnectionConfig,
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<FeedEvent>,
    inner: Mutex<Inner>,
}

/// Keeps one WebSocket attached to an exchange feed.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a manager for `url`. Nothing connects until [`Self::connect`].
    ///
    /// `clock` stamps `received_at` on every market event; pass the clock
    /// synchronization service in production.
    pub fn new(
        exchange: impl Into<String>,
        url: impl Into<String>,
        config: ConnectionConfig,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<FeedEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            exchange: exchange.into(),
            url: url.into(),
            config,
            clock,
            events,
            inner: Mutex::new(Inner::new()),
        });
        (Self { shared }, rx)
    }

    /// Open the socket.
    ///
    /// No-op when already connected or connecting. A failed handshake is
    /// returned to the caller and also reported as [`FeedEvent::Error`], and
    /// a reconnect is scheduled. Calling this after
    /// [`FeedEvent::MaxReconnectAttemptsReached`] starts a fresh budget.
    pub async fn connect(&self) -> Result<(), FeedError> {
        Arc::clone(&self.shared).connect_inner(Origin::User).await
    }

    /// Close the socket with code 1000 and stop reconnecting.
    ///
    /// Idempotent. Cancels an in-flight handshake and any pending reconnect.
    pub async fn disconnect(&self) {
        self.shared.disconnect().await;
    }

    /// Add a subscription, sending it right away when connected.
    ///
    /// Returns `false` if it was already registered.
    pub fn subscribe(&self, channel: &str, symbol: Option<&str>) -> bool {
        let mut inner = self.shared.inner.lock();
        let changed = inner.registry.subscribe(channel, symbol);
        if changed {
            let topic = Subscription::new(channel, symbol).key();
            tracing::info!(exchange = %self.shared.exchange, topic = %topic, "subscription added");
            self.shared
                .send_if_connected(&inner, BybitSubscribeRequest::subscribe(vec![topic]));
        }
        changed
    }

    /// Remove a subscription, sending the unsubscribe right away when
    /// connected.
    ///
    /// Returns `false` if it was not registered.
    pub fn unsubscribe(&self, channel: &str, symbol: Option<&str>) -> bool {
        let mut inner = self.shared.inner.lock();
        let changed = inner.registry.unsubscribe(channel, symbol);
        if changed {
            let topic = Subscription::new(channel, symbol).key();
            tracing::info!(exchange = %self.shared.exchange, topic = %topic, "subscription removed");
            self.shared
                .send_if_connected(&inner, BybitSubscribeRequest::unsubscribe(vec![topic]));
        }
        changed
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.inner.lock().registry.list_all()
    }

    pub fn exchange(&self) -> &str {
        &self.shared.exchange
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn stats(&self) -> ConnectionStats {
        let inner = self.shared.inner.lock();
        ConnectionStats {
            state: inner.state,
            reconnect_attempts: inner.reconnect_attempts,
            subscriptions: inner.registry.len(),
            ..inner.stats.clone()
        }
    }
}

impl Shared {
    fn emit(&self, event: FeedEvent) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.events.send(event);
    }

    fn send_if_connected(&self, inner: &Inner, request: BybitSubscribeRequest) {
        if inner.state != ConnectionState::Connected {
            return;
        }
        if let Some(tx) = &inner.outbound {
            let _ = tx.send(Outbound::Text(request.to_frame()));
        }
    }

    /// Boxed so the reconnect timer can spawn it from inside itself.
    fn connect_inner(self: Arc<Self>, origin: Origin) -> BoxFuture<'static, Result<(), FeedError>> {
        async move {
            let Some((generation, cancel)) = self.begin_connect(origin) else {
                return Ok(());
            };

            tracing::info!(
                exchange = %self.exchange,
                url = %self.url,
                generation,
                "connecting to WebSocket"
            );

            let handshake = tokio::time::timeout(
                self.config.handshake_timeout(),
                tokio_tungstenite::connect_async(self.url.as_str()),
            );
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(FeedError::Cancelled),
                outcome = handshake => outcome,
            };

            match outcome {
                Ok(Ok((ws, _response))) => self.connect_succeeded(generation, ws),
                Ok(Err(e)) => Err(self.connect_failed(
                    generation,
                    FeedError::Connection {
                        url: self.url.clone(),
                        reason: e.to_string(),
                    },
                )),
                Err(_elapsed) => Err(self.connect_failed(
                    generation,
                    FeedError::ConnectionTimeout {
                        url: self.url.clone(),
                        timeout_ms: self.config.handshake_timeout_ms,
                    },
                )),
            }
        }
        .boxed()
    }

    /// Claim the `Connecting` state. `None` means there is nothing to do.
    fn begin_connect(&self, origin: Origin) -> Option<(u64, CancellationToken)> {
        let mut inner = self.inner.lock();

        match origin {
            Origin::User => {
                inner.manual_close = false;
                if inner.exhausted {
                    tracing::info!(exchange = %self.exchange, "explicit connect resets reconnect budget");
                    inner.exhausted = false;
                    inner.reconnect_attempts = 0;
                }
            }
            Origin::Reconnect { ticket } => {
                let current = inner.reconnect.as_ref().map(|r| r.ticket);
                if current != Some(ticket) || inner.manual_close {
                    return None;
                }
                // This is the timer task itself, so release it without aborting.
                inner.reconnect = None;
            }
        }

        if matches!(
            inner.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            tracing::debug!(
                exchange = %self.exchange,
                state = ?inner.state,
                "connect ignored, already connected or connecting"
            );
            return None;
        }

        inner.cancel_reconnect();
        inner.state = ConnectionState::Connecting;
        inner.generation += 1;
        let cancel = CancellationToken::new();
        inner.handshake_cancel = Some(cancel.clone());
        Some((inner.generation, cancel))
    }

    fn connect_failed(self: &Arc<Self>, generation: u64, err: FeedError) -> FeedError {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return err;
        }
        inner.handshake_cancel = None;
        inner.mark_disconnected();
        tracing::warn!(
            exchange = %self.exchange,
            url = %self.url,
            error = %err,
            "WebSocket connection failed"
        );
        self.emit(FeedEvent::Error {
            message: err.to_string(),
        });
        self.schedule_reconnect(&mut inner);
        err
    }

    fn connect_succeeded(
        self: &Arc<Self>,
        generation: u64,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> Result<(), FeedError> {
        let mut inner = self.inner.lock();
        if inner.generation != generation || inner.state != ConnectionState::Connecting {
            // Superseded by disconnect(); dropping the stream closes it.
            return Err(FeedError::Cancelled);
        }

        inner.handshake_cancel = None;
        inner.state = ConnectionState::Connected;
        inner.reconnect_attempts = 0;
        inner.exhausted = false;
        inner.awaiting_pong = false;
        inner.stats.connections_opened += 1;
        inner.stats.connected_since = Some(self.clock.now());

        let (tx, rx) = mpsc::unbounded_channel();
        inner.outbound = Some(tx.clone());

        tracing::info!(
            exchange = %self.exchange,
            url = %self.url,
            subscriptions = inner.registry.len(),
            "WebSocket connected"
        );
        self.emit(FeedEvent::Connected);

        let (sink, stream) = ws.split();
        inner.socket_task = Some(tokio::spawn(Arc::clone(self).run_socket(
            generation, sink, stream, rx,
        )));

        inner.stop_timers();
        inner.heartbeat = Some(self.spawn_heartbeat(generation, tx.clone()));
        let topics = inner.registry.topics();
        inner.resubscribe = Some(self.spawn_resubscribe(generation, tx, topics));
        Ok(())
    }

    /// Owns the socket until it closes, then hands the close to
    /// [`Self::handle_close`].
    async fn run_socket(
        self: Arc<Self>,
        generation: u64,
        mut sink: WsSink,
        mut stream: WsStream,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let (code, reason) = loop {
            tokio::select! {
                cmd = outbound.recv() => match cmd {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            break (ABNORMAL_CLOSURE, format!("send failed: {e}"));
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: MANUAL_DISCONNECT_REASON.into(),
                        };
                        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                            tracing::debug!(exchange = %self.exchange, error = %e, "close frame not sent");
                        }
                        break (NORMAL_CLOSURE, MANUAL_DISCONNECT_REASON.to_string());
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(generation, &text),
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = sink.send(Message::Pong(payload)).await {
                            break (ABNORMAL_CLOSURE, format!("pong failed: {e}"));
                        }
                    }
                    Some(Ok(Message::Pong(_))) => self.record_pong(generation),
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        tracing::debug!(exchange = %self.exchange, len = data.len(), "ignoring binary frame");
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => break (ABNORMAL_CLOSURE, e.to_string()),
                    None => break (ABNORMAL_CLOSURE, "stream ended".to_string()),
                },
            }
        };

        let _ = tokio::time::timeout(self.config.close_timeout(), sink.close()).await;
        self.handle_close(generation, code, reason);
    }

    fn handle_text(&self, generation: u64, text: &str) {
        let received_at = self.clock.now();
        let result = normalize(&self.exchange, text, received_at);

        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        inner.stats.messages_received += 1;
        inner.stats.last_message_at = Some(received_at);

        match result {
            Ok(NormalizedFrame::Pong) => {
                inner.awaiting_pong = false;
                inner.stats.pongs_received += 1;
                tracing::trace!(exchange = %self.exchange, "pong received");
            }
            Ok(NormalizedFrame::Ack {
                op,
                success,
                message,
            }) => {
                if success {
                    tracing::debug!(exchange = %self.exchange, op = %op, "request acknowledged");
                } else {
                    tracing::warn!(
                        exchange = %self.exchange,
                        op = %op,
                        message = %message,
                        "request rejected by exchange"
                    );
                }
            }
            Ok(NormalizedFrame::Market { topic, events }) => {
                self.emit(FeedEvent::MarketData { topic, received_at });
                for event in events {
                    self.emit(event.into());
                }
            }
            Err(e) => {
                inner.stats.parse_errors += 1;
                tracing::warn!(
                    exchange = %self.exchange,
                    error = %e,
                    parse_errors = inner.stats.parse_errors,
                    "dropping unparseable frame"
                );
            }
        }
    }

    fn record_pong(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.awaiting_pong = false;
            inner.stats.pongs_received += 1;
        }
    }

    /// Count a heartbeat. Returns `false` once the connection is superseded.
    fn record_ping(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation || inner.state != ConnectionState::Connected {
            return false;
        }
        if inner.awaiting_pong {
            inner.stats.missed_pongs += 1;
            tracing::warn!(
                exchange = %self.exchange,
                missed_pongs = inner.stats.missed_pongs,
                "no pong within heartbeat interval"
            );
        }
        inner.awaiting_pong = true;
        inner.stats.pings_sent += 1;
        true
    }

    fn spawn_heartbeat(
        self: &Arc<Self>,
        generation: u64,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        let period = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !shared.record_ping(generation) {
                    break;
                }
                if tx.send(Outbound::Text(PING_FRAME.to_string())).is_err() {
                    break;
                }
                tracing::trace!(exchange = %shared.exchange, "heartbeat ping sent");
            }
        })
    }

    fn spawn_resubscribe(
        self: &Arc<Self>,
        generation: u64,
        tx: mpsc::UnboundedSender<Outbound>,
        topics: Vec<String>,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        let spacing = self.config.resubscribe_delay();
        tokio::spawn(async move {
            for (i, topic) in topics.into_iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(spacing).await;
                }
                {
                    let inner = shared.inner.lock();
                    if inner.generation != generation {
                        return;
                    }
                    if !inner.registry.contains_topic(&topic) {
                        continue;
                    }
                }
                let frame = BybitSubscribeRequest::subscribe(vec![topic.clone()]).to_frame();
                if tx.send(Outbound::Text(frame)).is_err() {
                    return;
                }
                tracing::debug!(exchange = %shared.exchange, topic = %topic, "resubscribed");
            }
        })
    }

    fn handle_close(self: &Arc<Self>, generation: u64, code: u16, reason: String) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        inner.stop_timers();
        inner.socket_task = None;
        inner.mark_disconnected();

        self.emit(FeedEvent::Disconnected {
            code,
            reason: reason.clone(),
        });

        if code == NORMAL_CLOSURE {
            tracing::info!(
                exchange = %self.exchange,
                reason = %reason,
                "WebSocket closed normally by peer, not reconnecting"
            );
            return;
        }
        tracing::warn!(
            exchange = %self.exchange,
            code,
            reason = %reason,
            "WebSocket disconnected"
        );
        self.schedule_reconnect(&mut inner);
    }

    /// Arm the reconnect timer, or give up once the budget is spent.
    /// Called with the lock held.
    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner) {
        if inner.manual_close || inner.exhausted || inner.reconnect.is_some() {
            return;
        }

        if inner.reconnect_attempts >= self.config.max_reconnect_attempts {
            inner.exhausted = true;
            tracing::error!(
                exchange = %self.exchange,
                attempts = inner.reconnect_attempts,
                "max reconnect attempts reached, call connect() to resume"
            );
            self.emit(FeedEvent::MaxReconnectAttemptsReached {
                attempts: inner.reconnect_attempts,
            });
            return;
        }

        inner.reconnect_attempts += 1;
        let attempt = inner.reconnect_attempts;
        let delay = reconnect_delay(
            self.config.base_reconnect_delay(),
            attempt,
            self.config.backoff_exponent_cap,
        );
        inner.reconnect_seq += 1;
        let ticket = inner.reconnect_seq;

        tracing::info!(
            exchange = %self.exchange,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.emit(FeedEvent::Reconnecting { attempt, delay });

        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = shared.connect_inner(Origin::Reconnect { ticket }).await {
                tracing::debug!(attempt, error = %e, "reconnect attempt failed");
            }
        });
        inner.reconnect = Some(ScheduledReconnect { ticket, handle });
    }

    async fn disconnect(&self) {
        let (generation, socket_task, outbound) = {
            let mut inner = self.inner.lock();
            inner.manual_close = true;

            let idle = inner.state == ConnectionState::Disconnected
                && inner.socket_task.is_none()
                && inner.reconnect.is_none()
                && inner.handshake_cancel.is_none();
            if idle {
                tracing::debug!(exchange = %self.exchange, "disconnect ignored, already disconnected");
                return;
            }

            inner.generation += 1;
            if let Some(cancel) = inner.handshake_cancel.take() {
                cancel.cancel();
            }
            inner.cancel_reconnect();
            inner.stop_timers();
            // Under the lock: a racing connect() emits Connected after this.
            if inner.state == ConnectionState::Connected {
                self.emit(FeedEvent::Disconnected {
                    code: NORMAL_CLOSURE,
                    reason: MANUAL_DISCONNECT_REASON.to_string(),
                });
            }
            inner.state = ConnectionState::Closing;
            (inner.generation, inner.socket_task.take(), inner.outbound.take())
        };

        if let Some(tx) = outbound {
            let _ = tx.send(Outbound::Close);
        }
        if let Some(mut handle) = socket_task {
            if tokio::time::timeout(self.config.close_timeout(), &mut handle)
                .await
                .is_err()
            {
                tracing::warn!(
                    exchange = %self.exchange,
                    timeout_ms = self.config.close_timeout_ms,
                    "socket did not close in time, aborting"
                );
                handle.abort();
            }
        }

        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.mark_disconnected();
        }
        tracing::info!(exchange = %self.exchange, "WebSocket disconnected by request");
    }
}
