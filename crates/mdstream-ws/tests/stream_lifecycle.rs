//! Session lifecycle against a mock exchange.
//!
//! Covers subscribe/unsubscribe bookkeeping, rate budget accounting,
//! reconnection after abnormal closes and give-up behaviour, panic
//! containment, stale-data reporting and handshake timeouts.

mod common;

use common::mock_ws::MockWsServer;
use common::wait_until;
use mdstream_core::{CanonicalSymbol, Exchange, MarketEvent, Ticker, Timeframe, Topic};
use mdstream_ws::{
    BackoffPolicy, EventCallback, EventHub, ExchangeAdapter, FrameError, InboundFrame,
    SessionState, StaticEndpoint, StreamConfig, StreamEvent, StreamManager, SubscribeOutcome,
    UnsubscribeOutcome,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

/// Minimal JSON protocol: acks echo the request id, `{"price":..}` is a
/// ticker, `{"error":..}` terminates the session and `{"panic":..}`
/// makes the parser panic.
struct TestAdapter;

impl ExchangeAdapter for TestAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn build_subscribe_frame(&self, topic: &Topic, request_id: u64) -> String {
        serde_json::json!({"method": "SUBSCRIBE", "params": [topic.to_string()], "id": request_id})
            .to_string()
    }

    fn build_unsubscribe_frame(&self, topic: &Topic, request_id: u64) -> String {
        serde_json::json!({"method": "UNSUBSCRIBE", "params": [topic.to_string()], "id": request_id})
            .to_string()
    }

    fn parse_frame(&self, topic: &Topic, text: &str) -> Result<InboundFrame, FrameError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("panic").is_some() {
            panic!("parser bug");
        }
        if let Some(price) = value.get("price").and_then(|p| p.as_f64()) {
            return Ok(InboundFrame::Data(vec![MarketEvent::Ticker(Ticker {
                symbol: topic.symbol.clone(),
                exchange: Exchange::Binance,
                price,
                bid: price - 1.0,
                ask: price + 1.0,
                volume_24h: 1.0,
                high_24h: price,
                low_24h: price,
                change_24h_percent: 0.0,
                timestamp_ms: 0,
            })]));
        }
        if let Some(err) = value.get("error") {
            return Ok(InboundFrame::Error {
                code: None,
                message: err.to_string(),
            });
        }
        if value.get("result").is_some() {
            return Ok(InboundFrame::Ack {
                id: value.get("id").map(|v| v.to_string()),
            });
        }
        Ok(InboundFrame::Unknown(text.to_string()))
    }

    fn normalize_symbol(&self, symbol: &CanonicalSymbol) -> String {
        symbol.concatenated()
    }

    fn canonical_symbol(&self, native: &str) -> Option<CanonicalSymbol> {
        CanonicalSymbol::parse(native).ok()
    }

    fn map_timeframe(&self, timeframe: Timeframe) -> &'static str {
        timeframe.as_str()
    }
}

fn config(max_attempts: u32) -> StreamConfig {
    StreamConfig {
        backoff: BackoffPolicy {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
            jitter: Duration::ZERO,
            max_attempts,
        },
        close_timeout: Duration::from_millis(500),
        pool_size: 0,
        // Long window so the budget never refills mid-test.
        rate_limit_capacity: 20,
        rate_limit_interval: Duration::from_secs(60),
        rate_limit_max_wait: Duration::from_secs(120),
        ..StreamConfig::default()
    }
}

fn manager(url: String, config: StreamConfig) -> StreamManager {
    StreamManager::new(
        config,
        Arc::new(TestAdapter),
        Arc::new(StaticEndpoint::url(url)),
        Arc::new(EventHub::new(256)),
    )
}

fn topic() -> Topic {
    Topic::ticker(Exchange::Binance, CanonicalSymbol::parse("BTC-USDT").unwrap())
}

fn collector() -> (EventCallback, Arc<Mutex<Vec<f64>>>) {
    let prices = Arc::new(Mutex::new(Vec::new()));
    let sink = prices.clone();
    let callback: EventCallback = Arc::new(move |event| {
        if let MarketEvent::Ticker(t) = event {
            sink.lock().push(t.price);
        }
    });
    (callback, prices)
}

async fn next_matching<F>(rx: &mut broadcast::Receiver<StreamEvent>, pred: F) -> StreamEvent
where
    F: Fn(&StreamEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("lifecycle channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_subscribed(mgr: &StreamManager, server: &MockWsServer, connections: u32) {
    assert!(
        wait_until(
            || server.received_containing("\"SUBSCRIBE\"") >= connections as usize
                && mgr.session_state(&topic()) == Some(SessionState::Subscribed),
            WAIT
        )
        .await,
        "session never reached Subscribed"
    );
}

#[tokio::test]
async fn test_data_delivered_in_frame_order() {
    let server = MockWsServer::start().await;
    let mgr = manager(server.url(), config(5));
    let (callback, prices) = collector();

    mgr.subscribe(topic(), callback).unwrap();
    wait_subscribed(&mgr, &server, 1).await;

    for price in [100.0, 101.0, 102.0, 103.0] {
        server.push(format!(r#"{{"price":{price}}}"#));
    }
    assert!(wait_until(|| prices.lock().len() == 4, WAIT).await);
    assert_eq!(*prices.lock(), vec![100.0, 101.0, 102.0, 103.0]);

    mgr.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_closes_cleanly_and_leaves_no_residue() {
    let server = MockWsServer::start().await;
    let mgr = manager(server.url(), config(5));
    let (callback, _) = collector();

    mgr.subscribe(topic(), callback).unwrap();
    wait_subscribed(&mgr, &server, 1).await;

    assert_eq!(mgr.unsubscribe(&topic()).await, UnsubscribeOutcome::Unsubscribed);

    assert_eq!(server.received_containing("\"UNSUBSCRIBE\""), 1);
    assert!(wait_until(|| server.live_connections() == 0, WAIT).await);
    assert!(!mgr.is_subscribed(&topic()));
    assert!(mgr.session_state(&topic()).is_none());
    assert!(mgr.topics().is_empty());
    assert_eq!(mgr.pending_reconnects(), 0);
    assert_eq!(mgr.tracked_topics(), 0);

    // No reconnect follows an operator-requested close.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.connection_count(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_resubscribe_consumes_no_rate_token() {
    let server = MockWsServer::start().await;
    let mgr = manager(server.url(), config(5));
    let (callback, _) = collector();

    mgr.subscribe(topic(), callback.clone()).unwrap();
    wait_subscribed(&mgr, &server, 1).await;
    let remaining = mgr.rate_limiter().remaining();
    assert_eq!(remaining, 19);

    assert_eq!(
        mgr.subscribe(topic(), callback).unwrap(),
        SubscribeOutcome::AlreadySubscribed
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mgr.rate_limiter().remaining(), remaining);
    assert_eq!(server.connection_count(), 1);

    mgr.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_abnormal_close_reconnects_and_resets_attempts() {
    let server = MockWsServer::start().await;
    // One reattempt allowed: surviving three drops requires the counter
    // to go back to zero after each successful open.
    let mgr = manager(server.url(), config(1));
    let mut events = mgr.hub().lifecycle();
    let (callback, prices) = collector();

    mgr.subscribe(topic(), callback).unwrap();
    wait_subscribed(&mgr, &server, 1).await;

    for round in 1..=3u32 {
        server.drop_connections();
        let event = next_matching(&mut events, |e| {
            matches!(e, StreamEvent::StreamDisconnected { .. })
        })
        .await;
        let StreamEvent::StreamDisconnected {
            code,
            will_reconnect,
            ..
        } = event
        else {
            unreachable!()
        };
        assert_eq!(code, 1006);
        assert!(will_reconnect);

        next_matching(&mut events, |e| matches!(e, StreamEvent::StreamConnected { .. })).await;
        wait_subscribed(&mgr, &server, round + 1).await;
        assert_eq!(server.connection_count(), round + 1);
    }

    assert_eq!(mgr.stats().reconnects, 3);

    // Same topic and callback after reconnecting.
    server.push(r#"{"price":7.0}"#);
    assert!(wait_until(|| prices.lock().as_slice() == [7.0], WAIT).await);

    mgr.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_exchange_error_frame_forces_reconnect() {
    let server = MockWsServer::start().await;
    let mgr = manager(server.url(), config(5));
    let mut events = mgr.hub().lifecycle();
    let (callback, _) = collector();

    mgr.subscribe(topic(), callback).unwrap();
    wait_subscribed(&mgr, &server, 1).await;

    server.push(r#"{"error":"invalid stream"}"#);
    next_matching(&mut events, |e| matches!(e, StreamEvent::StreamError { .. })).await;
    let event = next_matching(&mut events, |e| {
        matches!(e, StreamEvent::StreamDisconnected { .. })
    })
    .await;
    assert!(matches!(
        event,
        StreamEvent::StreamDisconnected { code: 4000, will_reconnect: true, .. }
    ));
    wait_subscribed(&mgr, &server, 2).await;

    mgr.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_normal_remote_close_does_not_reconnect() {
    let server = MockWsServer::start().await;
    let mgr = manager(server.url(), config(5));
    let mut events = mgr.hub().lifecycle();
    let (callback, _) = collector();

    mgr.subscribe(topic(), callback).unwrap();
    wait_subscribed(&mgr, &server, 1).await;

    server.close_connections(1000);
    let event = next_matching(&mut events, |e| {
        matches!(e, StreamEvent::StreamDisconnected { .. })
    })
    .await;
    assert!(matches!(
        event,
        StreamEvent::StreamDisconnected { code: 1000, will_reconnect: false, .. }
    ));

    assert!(wait_until(|| !mgr.is_subscribed(&topic()), WAIT).await);
    assert_eq!(mgr.tracked_topics(), 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.connection_count(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_gives_up_exactly_once_after_cap() {
    // Nobody listens on this port.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let mgr = manager(url, config(3));
    let mut events = mgr.hub().lifecycle();
    let (callback, _) = collector();
    mgr.subscribe(topic(), callback).unwrap();

    let event = next_matching(&mut events, |e| matches!(e, StreamEvent::GaveUp { .. })).await;
    assert!(matches!(event, StreamEvent::GaveUp { attempts: 3, .. }));

    // Initial connect plus three reattempts.
    assert_eq!(mgr.rate_limiter().remaining(), 20 - 4);
    assert!(!mgr.is_subscribed(&topic()));
    assert_eq!(mgr.pending_reconnects(), 0);
    assert_eq!(mgr.tracked_topics(), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut extra = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, StreamEvent::GaveUp { .. }) {
            extra += 1;
        }
    }
    assert_eq!(extra, 0, "GaveUp emitted more than once");

    // The consumer may subscribe again after giving up.
    let (callback, _) = collector();
    assert_eq!(
        mgr.subscribe(topic(), callback).unwrap(),
        SubscribeOutcome::Subscribed
    );
    mgr.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frames_are_counted_and_skipped() {
    let server = MockWsServer::start().await;
    let mgr = manager(server.url(), config(5));
    let (callback, prices) = collector();

    mgr.subscribe(topic(), callback).unwrap();
    wait_subscribed(&mgr, &server, 1).await;

    server.push("not json at all");
    server.push(r#"{"unexpected":"shape"}"#);
    server.push(r#"{"price":42.0}"#);

    assert!(wait_until(|| prices.lock().len() == 1, WAIT).await);
    let stats = mgr.stats();
    assert_eq!(stats.malformed_frames, 2);
    assert_eq!(stats.healthy, 1);
    assert_eq!(server.connection_count(), 1);

    mgr.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_stats_and_health_across_sessions() {
    let server = MockWsServer::start().await;
    let mgr = manager(server.url(), config(5));
    let btc = CanonicalSymbol::parse("BTC-USDT").unwrap();

    let topics = [
        Topic::ticker(Exchange::Binance, btc.clone()),
        Topic::order_book(Exchange::Binance, btc.clone()),
        Topic::trades(Exchange::Binance, btc.clone()),
        Topic::candles(Exchange::Binance, btc, Timeframe::M1),
    ];
    for t in &topics {
        let (callback, _) = collector();
        mgr.subscribe(t.clone(), callback).unwrap();
    }
    assert!(wait_until(|| mgr.stats().healthy == 4, WAIT).await);

    let stats = mgr.stats();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.unhealthy, 0);
    assert_eq!(
        (stats.tickers, stats.order_books, stats.trades, stats.candles),
        (1, 1, 1, 1)
    );
    assert!(stats.is_healthy());

    assert_eq!(mgr.unsubscribe_all().await, 4);
    assert_eq!(mgr.stats().total, 0);
    assert!(mgr.stats().is_healthy());

    server.shutdown().await;
}

#[tokio::test]
async fn test_panicking_parser_skips_frame_and_keeps_session() {
    let server = MockWsServer::start().await;
    let mgr = manager(server.url(), config(5));
    let (callback, prices) = collector();

    mgr.subscribe(topic(), callback).unwrap();
    wait_subscribed(&mgr, &server, 1).await;

    server.push(r#"{"panic":true}"#);
    server.push(r#"{"price":42.0}"#);
    assert!(wait_until(|| prices.lock().as_slice() == [42.0], WAIT).await);

    assert_eq!(mgr.stats().malformed_frames, 1);
    assert_eq!(mgr.session_state(&topic()), Some(SessionState::Subscribed));
    assert_eq!(server.connection_count(), 1);
    assert_eq!(server.live_connections(), 1);

    mgr.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_panicking_callback_reports_error_and_keeps_streaming() {
    let server = MockWsServer::start().await;
    let mgr = manager(server.url(), config(5));
    let mut events = mgr.hub().lifecycle();
    let prices = Arc::new(Mutex::new(Vec::new()));
    let sink = prices.clone();
    let callback: EventCallback = Arc::new(move |event| {
        if let MarketEvent::Ticker(t) = event {
            if t.price == 13.0 {
                panic!("callback bug");
            }
            sink.lock().push(t.price);
        }
    });

    mgr.subscribe(topic(), callback).unwrap();
    wait_subscribed(&mgr, &server, 1).await;

    server.push(r#"{"price":13.0}"#);
    let event = next_matching(&mut events, |e| matches!(e, StreamEvent::StreamError { .. })).await;
    let StreamEvent::StreamError { message, .. } = event else {
        unreachable!()
    };
    assert!(message.contains("callback bug"), "{message}");

    server.push(r#"{"price":14.0}"#);
    assert!(wait_until(|| prices.lock().as_slice() == [14.0], WAIT).await);
    assert_eq!(mgr.session_state(&topic()), Some(SessionState::Subscribed));
    assert_eq!(server.connection_count(), 1);

    mgr.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_staleness_loop_reports_quiet_topic_once() {
    let server = MockWsServer::start().await;
    let mgr = manager(
        server.url(),
        StreamConfig {
            staleness_threshold: Duration::from_millis(100),
            staleness_poll_interval: Duration::from_millis(50),
            ..config(5)
        },
    );
    let mut events = mgr.hub().lifecycle();
    let (callback, prices) = collector();
    let stop = CancellationToken::new();

    mgr.subscribe(topic(), callback).unwrap();
    wait_subscribed(&mgr, &server, 1).await;
    let monitor = mgr.spawn_staleness_loop(stop.clone());

    let event = next_matching(&mut events, |e| matches!(e, StreamEvent::StaleData { .. })).await;
    let StreamEvent::StaleData { topic: stale, age_ms } = event else {
        unreachable!()
    };
    assert_eq!(stale, topic());
    assert!(age_ms >= 100);
    assert_eq!(mgr.check_staleness(), 0, "same episode reported twice");

    // Advisory only: the session stays up.
    assert_eq!(mgr.session_state(&topic()), Some(SessionState::Subscribed));

    // Fresh data re-arms the topic for the next quiet period.
    server.push(r#"{"price":1.0}"#);
    assert!(wait_until(|| prices.lock().len() == 1, WAIT).await);
    next_matching(&mut events, |e| matches!(e, StreamEvent::StaleData { .. })).await;

    stop.cancel();
    monitor.await.unwrap();
    mgr.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_handshake_timeout_schedules_reconnect() {
    // Accepts TCP but never answers the WebSocket upgrade.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicU32::new(0));
    let counter = accepts.clone();
    let acceptor = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(socket);
        }
    });

    let mgr = manager(
        format!("ws://{addr}"),
        StreamConfig {
            connection_timeout: Duration::from_millis(100),
            ..config(0)
        },
    );
    let mut events = mgr.hub().lifecycle();
    let (callback, _) = collector();

    mgr.subscribe(topic(), callback).unwrap();
    let event = next_matching(&mut events, |e| matches!(e, StreamEvent::StreamError { .. })).await;
    let StreamEvent::StreamError { message, .. } = event else {
        unreachable!()
    };
    assert!(message.contains("timed out"), "{message}");

    assert!(wait_until(|| accepts.load(Ordering::SeqCst) > 1, WAIT).await);
    assert!(matches!(
        mgr.session_state(&topic()),
        Some(SessionState::Reconnecting | SessionState::Connecting)
    ));
    assert_eq!(mgr.stats().healthy, 0);

    mgr.shutdown().await;
    assert!(mgr.topics().is_empty());
    acceptor.abort();
}
