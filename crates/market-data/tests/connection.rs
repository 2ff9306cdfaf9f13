//! Connection manager behavior against an in-process WebSocket server.

use std::collections::BTreeSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use tw_core::clock::SystemClock;
use tw_core::config::ConnectionConfig;
use tw_market_data::{ConnectionManager, ConnectionState, FeedError, FeedEvent};

type ServerWs = WebSocketStream<TcpStream>;

fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        handshake_timeout_ms: 2_000,
        heartbeat_interval_ms: 60_000,
        base_reconnect_delay_ms: 10,
        max_reconnect_attempts: 10,
        backoff_exponent_cap: 5,
        resubscribe_delay_ms: 5,
        close_timeout_ms: 500,
    }
}

fn manager(addr: SocketAddr, config: ConnectionConfig) -> (ConnectionManager, mpsc::UnboundedReceiver<FeedEvent>) {
    ConnectionManager::new("bybit", format!("ws://{addr}"), config, Arc::new(SystemClock))
}

/// Accept WebSocket connections forever, handing each to `handler` with its
/// zero-based index. Returns the address and the TCP accept counter.
async fn spawn_server<F, Fut>(handler: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(usize, ServerWs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepts);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let Ok(ws) = accept_async(stream).await else {
                continue;
            };
            tokio::spawn(handler(index, ws));
        }
    });
    (addr, accepts)
}

/// Drain a server-side socket until the client goes away.
async fn drain(ws: &mut ServerWs) {
    while let Some(Ok(_)) = ws.next().await {}
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<FeedEvent>) -> FeedEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for feed event")
        .expect("feed event channel closed")
}

/// Everything currently queued, after giving in-flight work a moment.
async fn quiet_events(rx: &mut mpsc::UnboundedReceiver<FeedEvent>, settle: Duration) -> Vec<FeedEvent> {
    tokio::time::sleep(settle).await;
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn subscribe_frame(topic: &str) -> String {
    format!(r#"{{"op":"subscribe","args":["{topic}"]}}"#)
}

#[tokio::test]
async fn resubscribes_exact_set_after_abnormal_close() {
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<(usize, String)>();
    let (addr, accepts) = spawn_server(move |index, mut ws| {
        let frames_tx = frames_tx.clone();
        async move {
            let mut subscribes = 0;
            let mut pings = 0;
            let mut closed = false;
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    if text == r#"{"op":"ping"}"# {
                        pings += 1;
                    } else {
                        subscribes += 1;
                    }
                    let _ = frames_tx.send((index, text));
                    // Drop the first connection only once the heartbeat is running.
                    if index == 0 && !closed && subscribes == 2 && pings >= 1 {
                        closed = true;
                        let _ = ws
                            .close(Some(CloseFrame {
                                code: CloseCode::Error,
                                reason: "server restart".into(),
                            }))
                            .await;
                    }
                }
            }
        }
    })
    .await;

    let config = ConnectionConfig {
        heartbeat_interval_ms: 20,
        ..test_config()
    };
    let (mgr, mut rx) = manager(addr, config);
    assert!(mgr.subscribe("tickers", Some("BTCUSDT")));
    assert!(mgr.subscribe("publicTrade", Some("BTCUSDT")));
    mgr.connect().await.unwrap();

    assert_eq!(next_event(&mut rx).await, FeedEvent::Connected);
    match next_event(&mut rx).await {
        FeedEvent::Disconnected { code, reason } => {
            assert_eq!(code, 1011);
            assert_eq!(reason, "server restart");
        }
        other => panic!("expected disconnect, got {other:?}"),
    }
    let pings_before_close = mgr.stats().pings_sent;
    assert!(pings_before_close > 0, "heartbeat never fired");
    assert_eq!(
        next_event(&mut rx).await,
        FeedEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(10)
        }
    );
    assert_eq!(next_event(&mut rx).await, FeedEvent::Connected);

    let expected: BTreeSet<String> = [
        subscribe_frame("publicTrade.BTCUSDT"),
        subscribe_frame("tickers.BTCUSDT"),
    ]
    .into_iter()
    .collect();

    let mut first = BTreeSet::new();
    let mut second = BTreeSet::new();
    let mut second_pings = 0;
    while first.len() < 2 || second.len() < 2 || second_pings == 0 {
        let (index, frame) = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
            .await
            .expect("timed out waiting for subscribe frames")
            .expect("frame channel closed");
        if frame == r#"{"op":"ping"}"# {
            if index == 1 {
                second_pings += 1;
            }
            continue;
        }
        match index {
            0 => first.insert(frame),
            1 => second.insert(frame),
            _ => panic!("unexpected third connection"),
        };
    }
    assert_eq!(first, expected);
    assert_eq!(second, expected);

    assert!(mgr.is_connected());
    assert_eq!(accepts.load(Ordering::SeqCst), 2);
    let stats = mgr.stats();
    assert_eq!(stats.reconnect_attempts, 0);
    assert_eq!(stats.connections_opened, 2);
    assert_eq!(stats.subscriptions, 2);
    assert!(stats.pings_sent > pings_before_close);

    let rest = quiet_events(&mut rx, Duration::from_millis(100)).await;
    assert!(
        !rest.iter().any(|e| matches!(e, FeedEvent::Reconnecting { .. })),
        "unexpected extra reconnect: {rest:?}"
    );

    mgr.disconnect().await;
}

#[tokio::test]
async fn heartbeat_sends_pings_and_answers_protocol_pings() {
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (addr, _) = spawn_server(move |_, mut ws| {
        let pong_tx = pong_tx.clone();
        async move {
            let _ = ws.send(Message::Ping(vec![7, 7, 7])).await;
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) if text == r#"{"op":"ping"}"# => {
                        let reply = r#"{"success":true,"ret_msg":"pong","conn_id":"t","op":"ping"}"#;
                        let _ = ws.send(Message::Text(reply.to_string())).await;
                    }
                    Message::Pong(payload) => {
                        let _ = pong_tx.send(payload);
                    }
                    _ => {}
                }
            }
        }
    })
    .await;

    let config = ConnectionConfig {
        heartbeat_interval_ms: 30,
        ..test_config()
    };
    let (mgr, mut rx) = manager(addr, config);
    mgr.connect().await.unwrap();
    assert_eq!(next_event(&mut rx).await, FeedEvent::Connected);

    let payload = tokio::time::timeout(Duration::from_secs(5), pong_rx.recv())
        .await
        .expect("no pong for server ping")
        .expect("pong channel closed");
    assert_eq!(payload, vec![7, 7, 7]);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = mgr.stats();
        if stats.pings_sent >= 3 && stats.pongs_received >= 3 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "heartbeat stalled: {stats:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(mgr.is_connected());

    mgr.disconnect().await;
}

#[tokio::test]
async fn malformed_frame_does_not_break_connection() {
    let (addr, _) = spawn_server(|_, mut ws| async move {
        let frames = [
            r#"{"topic":"tickers.BTCUSDT","type":"snapshot","ts":1706000000000,"data":{"symbol":"BTCUSDT","lastPrice":"65000.5"}}"#,
            "{this is not json",
            r#"{"topic":"publicTrade.BTCUSDT","type":"snapshot","ts":1706000000100,"data":[{"T":1706000000050,"s":"BTCUSDT","S":"Buy","v":"0.5","p":"65001","i":"t1"}]}"#,
        ];
        for frame in frames {
            let _ = ws.send(Message::Text(frame.to_string())).await;
        }
        drain(&mut ws).await;
    })
    .await;

    let (mgr, mut rx) = manager(addr, test_config());
    mgr.connect().await.unwrap();
    assert_eq!(next_event(&mut rx).await, FeedEvent::Connected);

    match next_event(&mut rx).await {
        FeedEvent::MarketData { topic, .. } => assert_eq!(topic, "tickers.BTCUSDT"),
        other => panic!("expected market data, got {other:?}"),
    }
    match next_event(&mut rx).await {
        FeedEvent::Ticker(t) => assert_eq!(t.last_price, 65000.5),
        other => panic!("expected ticker, got {other:?}"),
    }
    match next_event(&mut rx).await {
        FeedEvent::MarketData { topic, .. } => assert_eq!(topic, "publicTrade.BTCUSDT"),
        other => panic!("expected market data, got {other:?}"),
    }
    match next_event(&mut rx).await {
        FeedEvent::Trade(t) => {
            assert_eq!(t.trade_id, "t1");
            assert_eq!(t.price, 65001.0);
        }
        other => panic!("expected trade, got {other:?}"),
    }

    assert!(mgr.is_connected());
    let stats = mgr.stats();
    assert_eq!(stats.messages_received, 3);
    assert_eq!(stats.parse_errors, 1);
    assert!(stats.last_message_at.is_some());

    mgr.disconnect().await;
}

#[tokio::test]
async fn stops_after_max_reconnect_attempts() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let config = ConnectionConfig {
        base_reconnect_delay_ms: 1,
        backoff_exponent_cap: 0,
        max_reconnect_attempts: 10,
        ..test_config()
    };
    let (mgr, mut rx) = manager(addr, config);

    let err = mgr.connect().await.unwrap_err();
    assert!(matches!(err, FeedError::Connection { .. }), "{err:?}");

    let mut attempts = Vec::new();
    let mut errors = 0;
    loop {
        match next_event(&mut rx).await {
            FeedEvent::Error { .. } => errors += 1,
            FeedEvent::Reconnecting { attempt, delay } => {
                assert_eq!(delay, Duration::from_millis(1));
                attempts.push(attempt);
            }
            FeedEvent::MaxReconnectAttemptsReached { attempts: n } => {
                assert_eq!(n, 10);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(attempts, (1..=10).collect::<Vec<_>>());
    assert_eq!(errors, 11);

    let rest = quiet_events(&mut rx, Duration::from_millis(100)).await;
    assert!(rest.is_empty(), "activity after budget exhausted: {rest:?}");
    assert_eq!(mgr.state(), ConnectionState::Disconnected);

    // An explicit connect starts a fresh budget.
    assert!(mgr.connect().await.is_err());
    assert!(matches!(next_event(&mut rx).await, FeedEvent::Error { .. }));
    assert!(matches!(
        next_event(&mut rx).await,
        FeedEvent::Reconnecting { attempt: 1, .. }
    ));

    mgr.disconnect().await;
    let rest = quiet_events(&mut rx, Duration::from_millis(50)).await;
    assert!(
        !rest.iter().any(|e| matches!(e, FeedEvent::Reconnecting { .. })),
        "reconnect after disconnect: {rest:?}"
    );
}

#[tokio::test]
async fn concurrent_connects_open_one_socket() {
    let (addr, accepts) = spawn_server(|_, mut ws| async move { drain(&mut ws).await }).await;
    let (mgr, mut rx) = manager(addr, test_config());

    let other = mgr.clone();
    let (a, b) = tokio::join!(mgr.connect(), other.connect());
    a.unwrap();
    b.unwrap();

    assert_eq!(next_event(&mut rx).await, FeedEvent::Connected);
    let rest = quiet_events(&mut rx, Duration::from_millis(100)).await;
    assert!(rest.is_empty(), "{rest:?}");
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
    assert_eq!(mgr.stats().connections_opened, 1);

    mgr.disconnect().await;
}

#[tokio::test]
async fn disconnect_then_connect() {
    let (close_tx, mut close_rx) = mpsc::unbounded_channel::<Option<u16>>();
    let (addr, accepts) = spawn_server(move |_, mut ws| {
        let close_tx = close_tx.clone();
        async move {
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Close(frame) = msg {
                    let _ = close_tx.send(frame.map(|f| u16::from(f.code)));
                }
            }
        }
    })
    .await;

    let (mgr, mut rx) = manager(addr, test_config());
    mgr.connect().await.unwrap();
    assert_eq!(next_event(&mut rx).await, FeedEvent::Connected);

    mgr.disconnect().await;
    assert_eq!(
        next_event(&mut rx).await,
        FeedEvent::Disconnected {
            code: 1000,
            reason: "manual disconnect".to_string()
        }
    );
    assert_eq!(mgr.state(), ConnectionState::Disconnected);

    let code = tokio::time::timeout(Duration::from_secs(5), close_rx.recv())
        .await
        .expect("server never saw a close frame")
        .expect("close channel closed");
    assert_eq!(code, Some(1000));

    // Idempotent and never reconnects on its own.
    mgr.disconnect().await;
    let rest = quiet_events(&mut rx, Duration::from_millis(100)).await;
    assert!(rest.is_empty(), "{rest:?}");

    mgr.connect().await.unwrap();
    assert_eq!(next_event(&mut rx).await, FeedEvent::Connected);
    assert_eq!(accepts.load(Ordering::SeqCst), 2);
    assert_eq!(mgr.stats().connections_opened, 2);

    mgr.disconnect().await;
}

#[tokio::test]
async fn normal_close_from_server_does_not_reconnect() {
    let (addr, accepts) = spawn_server(|_, mut ws| async move {
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            }))
            .await;
        drain(&mut ws).await;
    })
    .await;

    let (mgr, mut rx) = manager(addr, test_config());
    mgr.connect().await.unwrap();
    assert_eq!(next_event(&mut rx).await, FeedEvent::Connected);
    assert_eq!(
        next_event(&mut rx).await,
        FeedEvent::Disconnected {
            code: 1000,
            reason: "bye".to_string()
        }
    );

    let rest = quiet_events(&mut rx, Duration::from_millis(100)).await;
    assert!(rest.is_empty(), "{rest:?}");
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
    assert_eq!(mgr.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn live_subscribe_sends_frame_immediately() {
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();
    let (addr, _) = spawn_server(move |_, mut ws| {
        let frames_tx = frames_tx.clone();
        async move {
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let _ = frames_tx.send(text);
                }
            }
        }
    })
    .await;

    let (mgr, mut rx) = manager(addr, test_config());
    mgr.connect().await.unwrap();
    assert_eq!(next_event(&mut rx).await, FeedEvent::Connected);

    assert!(mgr.subscribe("orderbook.50", Some("ETHUSDT")));
    assert!(!mgr.subscribe("orderbook.50", Some("ETHUSDT")));
    assert!(mgr.unsubscribe("orderbook.50", Some("ETHUSDT")));

    let mut frames = Vec::new();
    while frames.len() < 2 {
        let frame = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
            .await
            .expect("timed out waiting for frames")
            .expect("frame channel closed");
        frames.push(frame);
    }
    assert_eq!(frames[0], subscribe_frame("orderbook.50.ETHUSDT"));
    assert_eq!(
        frames[1],
        r#"{"op":"unsubscribe","args":["orderbook.50.ETHUSDT"]}"#
    );

    mgr.disconnect().await;
}

/// Accept TCP connections and never answer the WebSocket upgrade.
async fn spawn_silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

#[tokio::test]
async fn handshake_timeout_reports_and_schedules_reconnect() {
    let addr = spawn_silent_server().await;
    let config = ConnectionConfig {
        handshake_timeout_ms: 100,
        ..test_config()
    };
    let (mgr, mut rx) = manager(addr, config);

    let err = mgr.connect().await.unwrap_err();
    match err {
        FeedError::ConnectionTimeout { timeout_ms, .. } => assert_eq!(timeout_ms, 100),
        other => panic!("expected timeout, got {other:?}"),
    }
    match next_event(&mut rx).await {
        FeedEvent::Error { message } => assert!(message.contains("timed out"), "{message}"),
        other => panic!("expected error event, got {other:?}"),
    }
    assert_eq!(
        next_event(&mut rx).await,
        FeedEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(10)
        }
    );

    mgr.disconnect().await;
    assert_eq!(mgr.state(), ConnectionState::Disconnected);
    let rest = quiet_events(&mut rx, Duration::from_millis(250)).await;
    assert!(
        !rest.iter().any(|e| matches!(e, FeedEvent::Reconnecting { .. })),
        "reconnect after disconnect: {rest:?}"
    );
}

#[tokio::test]
async fn disconnect_cancels_inflight_handshake() {
    let addr = spawn_silent_server().await;
    let config = ConnectionConfig {
        handshake_timeout_ms: 5_000,
        ..test_config()
    };
    let (mgr, mut rx) = manager(addr, config);

    let connecting = mgr.clone();
    let attempt = tokio::spawn(async move { connecting.connect().await });
    tokio::time::timeout(Duration::from_secs(5), async {
        while mgr.state() != ConnectionState::Connecting {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connect never started");

    mgr.disconnect().await;
    let result = tokio::time::timeout(Duration::from_secs(1), attempt)
        .await
        .expect("handshake was not cancelled")
        .unwrap();
    assert!(matches!(result, Err(FeedError::Cancelled)), "{result:?}");

    assert_eq!(mgr.state(), ConnectionState::Disconnected);
    let rest = quiet_events(&mut rx, Duration::from_millis(100)).await;
    assert!(rest.is_empty(), "{rest:?}");
}

#[tokio::test]
async fn racing_disconnect_and_connect_end_connected() {
    let (addr, accepts) = spawn_server(|index, mut ws| async move {
        if index == 0 {
            // Never read, so the client's close handshake gets no reply.
            tokio::time::sleep(Duration::from_secs(2)).await;
        } else {
            drain(&mut ws).await;
        }
    })
    .await;

    let (mgr, mut rx) = manager(addr, test_config());
    mgr.connect().await.unwrap();
    assert_eq!(next_event(&mut rx).await, FeedEvent::Connected);

    let (_, connected) = tokio::join!(mgr.disconnect(), mgr.connect());
    connected.unwrap();

    let events = quiet_events(&mut rx, Duration::from_millis(200)).await;
    assert_eq!(
        events,
        vec![
            FeedEvent::Disconnected {
                code: 1000,
                reason: "manual disconnect".to_string()
            },
            FeedEvent::Connected,
        ]
    );
    assert!(mgr.is_connected());
    assert_eq!(accepts.load(Ordering::SeqCst), 2);

    mgr.disconnect().await;
    assert_eq!(
        next_event(&mut rx).await,
        FeedEvent::Disconnected {
            code: 1000,
            reason: "manual disconnect".to_string()
        }
    );
    assert_eq!(mgr.state(), ConnectionState::Disconnected);
}
