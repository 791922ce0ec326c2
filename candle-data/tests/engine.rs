use candle_data::{
    Engine, EngineError,
    aggregator::CandleChange,
    candle::Candle,
    config::{EngineConfig, ReconnectConfig},
    exchange::{Venue, canonical::CanonicalParser},
    hub::{Subscription, Update},
    instrument::{InstrumentId, SourceId},
    streams::reconnect::FeedStatus,
    transport::channel::{ChannelConnection, ChannelTransport, ChannelTransportHandle},
};
use std::time::Duration;
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(60);

fn trade(instrument: &str, timestamp_millis: i64, price: f64, quantity: f64, sequence: u64) -> String {
    format!(
        r#"{{"instrument":"{instrument}","timestamp":{timestamp_millis},"price":{price},"quantity":{quantity},"side":"buy","sequence":{sequence}}}"#
    )
}

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_intervals(vec![60])
        .with_coalesce_window(Duration::ZERO)
        .with_reconnect(
            ReconnectConfig::new(Duration::from_millis(10), Duration::from_millis(40), 3)
                .with_jitter(Duration::ZERO),
        )
}

/// Add a canonical feed backed by a [`ChannelTransport`] and wait for its first connection.
async fn connected_feed(
    engine: &Engine,
    source: &str,
) -> (ChannelTransportHandle, ChannelConnection, watch::Receiver<FeedStatus>) {
    let source = SourceId::new(source);
    let (transport, handle) = ChannelTransport::new(source.as_str());
    let connection = handle.open(64).unwrap();

    engine
        .add_feed(source.clone(), transport, CanonicalParser)
        .unwrap();

    let mut status = engine.watch_feed(&source).unwrap();
    wait_for_status(&mut status, FeedStatus::Connected).await;

    (handle, connection, status)
}

async fn wait_for_status(status: &mut watch::Receiver<FeedStatus>, expected: FeedStatus) {
    tokio::time::timeout(WAIT, status.wait_for(|status| *status == expected))
        .await
        .unwrap_or_else(|_| panic!("feed never reached {expected}"))
        .unwrap();
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}

fn candle_updates(subscription: &mut Subscription) -> Vec<(CandleChange, Candle)> {
    std::iter::from_fn(|| subscription.try_recv())
        .filter_map(|update| match update {
            Update::Candle(update) => Some((update.change, update.candle)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_two_bucket_scenario_and_amend() {
    let engine = Engine::new(config()).unwrap();
    let btc = InstrumentId::new("BTCUSDT");
    let (_handle, connection, _status) = connected_feed(&engine, "canonical").await;

    for payload in [
        trade("BTC-USDT", 0, 10.0, 1.0, 1),
        trade("BTC-USDT", 30_000, 12.0, 2.0, 2),
        trade("BTC-USDT", 61_000, 9.0, 1.0, 3),
    ] {
        assert!(connection.send(payload).await);
    }
    eventually(|| engine.metrics().trades_accepted == 3).await;

    let candles = engine.snapshot(&btc, 60, 10).unwrap();
    assert_eq!(candles.len(), 2);
    assert_eq!(
        (candles[0].bucket_start_millis, candles[0].open, candles[0].high, candles[0].low, candles[0].close, candles[0].volume, candles[0].is_closed),
        (0, 10.0, 12.0, 10.0, 12.0, 3.0, true)
    );
    assert_eq!(
        (candles[1].bucket_start_millis, candles[1].open, candles[1].high, candles[1].low, candles[1].close, candles[1].volume, candles[1].is_closed),
        (60_000, 9.0, 9.0, 9.0, 9.0, 1.0, false)
    );

    // Out-of-order trade amends the closed bucket instead of being dropped
    assert!(connection.send(trade("BTC-USDT", 45_000, 11.0, 1.0, 4)).await);
    eventually(|| engine.metrics().trades_accepted == 4).await;

    let candles = engine.snapshot(&btc, 60, 10).unwrap();
    assert_eq!(candles[0].high, 12.0);
    assert_eq!(candles[0].volume, 4.0);
    assert_eq!(candles[0].trade_count, 3);
    assert_eq!(candles[0].close, 11.0);
    assert!(candles[0].is_closed);
    assert_eq!(candles[1].volume, 1.0);

    assert_eq!(engine.latest_price(&btc), Some(9.0));
    assert_eq!(engine.recent_trades(&btc, 10).len(), 4);
    assert_eq!(engine.instruments(), vec![btc]);
}

#[tokio::test]
async fn test_duplicates_and_rejects_do_not_change_candles() {
    let engine = Engine::new(config()).unwrap();
    let eth = InstrumentId::new("ETHUSDT");
    let (_handle, connection, _status) = connected_feed(&engine, "canonical").await;

    for payload in [
        trade("ETHUSDT", 1_000, 100.0, 1.0, 7),
        trade("ETHUSDT", 1_000, 100.0, 1.0, 7),
        "not json".to_string(),
        trade("ETHUSDT", 2_000, -1.0, 1.0, 8),
        r#"{"type":"heartbeat"}"#.to_string(),
        trade("ETHUSDT", 3_000, 101.0, 2.0, 9),
    ] {
        assert!(connection.send(payload).await);
    }
    eventually(|| engine.metrics().payloads_received == 6).await;

    let metrics = engine.metrics();
    assert_eq!(metrics.trades_accepted, 2);
    assert_eq!(metrics.duplicates, 1);
    assert_eq!(metrics.trades_rejected, 2);
    assert_eq!(metrics.rejects_by_reason.get("malformed_json"), Some(&1));
    assert_eq!(metrics.rejects_by_reason.get("non_positive_price"), Some(&1));
    assert_eq!(metrics.keep_alives, 1);

    let candles = engine.snapshot(&eth, 60, 10).unwrap();
    assert_eq!(candles.len(), 1);
    assert_eq!(candles[0].volume, 3.0);
    assert_eq!(candles[0].trade_count, 2);
    assert_eq!(candles[0].close, 101.0);
}

#[tokio::test]
async fn test_circuit_opens_after_max_attempts_until_reset() {
    let engine = Engine::new(config()).unwrap();
    let source = SourceId::new("flaky");
    let (transport, handle) = ChannelTransport::new("flaky");
    for _ in 0..5 {
        assert!(handle.fail("connection refused"));
    }

    engine
        .add_feed(source.clone(), transport, CanonicalParser)
        .unwrap();
    let mut status = engine.watch_feed(&source).unwrap();

    wait_for_status(&mut status, FeedStatus::CircuitOpen).await;
    assert_eq!(handle.attempts(), 3);
    assert_eq!(engine.metrics().circuit_opens, 1);

    // No further attempts while the circuit is open
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.attempts(), 3);
    assert_eq!(engine.feed_status(&source), Some(FeedStatus::CircuitOpen));

    // Reset re-arms the supervisor: the two remaining failures plus one success
    let _connection = handle.open(8).unwrap();
    engine.reset_feed(&source).unwrap();
    wait_for_status(&mut status, FeedStatus::Connected).await;
    assert_eq!(handle.attempts(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_stale_connection_is_replaced() {
    let engine = Engine::new(config().with_stale_timeout(Duration::from_secs(5))).unwrap();
    let (handle, connection, _status) = connected_feed(&engine, "quiet").await;
    let _next = handle.open(8).unwrap();

    // Keep-alives hold the connection open
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(connection.keep_alive().await);
    }
    assert_eq!(handle.attempts(), 1);

    // Silence beyond the stale timeout triggers a reconnect
    eventually(|| handle.attempts() == 2).await;
    assert_eq!(engine.metrics().stale_timeouts, 1);
    eventually(|| connection.is_closed()).await;
}

#[tokio::test]
async fn test_close_feed_drains_received_payloads() {
    let engine = Engine::new(
        config().with_reconnect(
            ReconnectConfig::new(Duration::from_secs(10), Duration::from_secs(10), 3)
                .with_jitter(Duration::ZERO),
        ),
    )
    .unwrap();
    let source = SourceId::new("drain");
    let (handle, connection, mut status) = connected_feed(&engine, "drain").await;

    for sequence in 0..100 {
        let payload = trade("SOLUSDT", 1_000 + sequence as i64, 20.0, 1.0, sequence);
        assert!(connection.send(payload).await);
    }

    // Connection ends once every payload has been read, then the supervisor backs off
    drop(connection);
    wait_for_status(&mut status, FeedStatus::Disconnected).await;

    engine.close_feed(&source).await.unwrap();

    let candles = engine.snapshot(&InstrumentId::new("SOLUSDT"), 60, 10).unwrap();
    assert_eq!(candles.len(), 1);
    assert_eq!(candles[0].trade_count, 100);
    assert_eq!(handle.attempts(), 1);

    assert_eq!(engine.feed_status(&source), None);
    assert_eq!(
        engine.reset_feed(&source),
        Err(EngineError::UnknownFeed(source.clone()))
    );
    assert_eq!(
        engine.close_feed(&source).await,
        Err(EngineError::UnknownFeed(source))
    );
}

#[tokio::test]
async fn test_subscription_receives_candles_trades_and_status() {
    let engine = Engine::new(config()).unwrap();
    let mut subscription = engine.subscribe(InstrumentId::new("btc/usdt"), 60).unwrap();
    let (_handle, connection, _status) = connected_feed(&engine, "canonical").await;

    for payload in [
        trade("BTCUSDT", 0, 10.0, 1.0, 1),
        trade("BTCUSDT", 30_000, 12.0, 2.0, 2),
        trade("ETHUSDT", 30_000, 1.0, 2.0, 3),
        trade("BTCUSDT", 61_000, 9.0, 1.0, 4),
    ] {
        assert!(connection.send(payload).await);
    }
    eventually(|| engine.metrics().trades_accepted == 4).await;

    let mut trades = 0;
    let mut candles = Vec::new();
    let mut statuses = Vec::new();
    while let Some(update) = subscription.try_recv() {
        match update {
            Update::Candle(update) => {
                assert_eq!(update.instrument, InstrumentId::new("BTCUSDT"));
                assert_eq!(update.interval_seconds, 60);
                candles.push((update.change, update.candle));
            }
            Update::Trade(tick) => {
                assert_eq!(tick.instrument, InstrumentId::new("BTCUSDT"));
                trades += 1;
            }
            Update::Status { status, .. } => statuses.push(status),
        }
    }

    assert_eq!(trades, 3);
    assert!(statuses.contains(&FeedStatus::Connected));

    let closed = candles
        .iter()
        .find(|(change, _)| *change == CandleChange::Closed)
        .map(|(_, candle)| candle.clone())
        .unwrap();
    assert_eq!((closed.bucket_start_millis, closed.close, closed.volume), (0, 12.0, 3.0));

    let (change, last) = candles.last().unwrap();
    assert_eq!(*change, CandleChange::Opened);
    assert_eq!(last.bucket_start_millis, 60_000);

    // No deliveries after unsubscribe
    assert!(engine.unsubscribe(subscription.id));
    assert!(connection.send(trade("BTCUSDT", 62_000, 9.5, 1.0, 5)).await);
    eventually(|| engine.metrics().trades_accepted == 5).await;
    assert!(candle_updates(&mut subscription).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_subscription_coalesces_within_window() {
    let engine =
        Engine::new(config().with_coalesce_window(Duration::from_millis(500))).unwrap();
    let mut subscription = engine.subscribe(InstrumentId::new("BTCUSDT"), 60).unwrap();
    let (_handle, connection, _status) = connected_feed(&engine, "canonical").await;

    for (sequence, price) in [10.0, 11.0, 12.0, 11.5].into_iter().enumerate() {
        let payload = trade("BTCUSDT", 1_000 * sequence as i64, price, 1.0, sequence as u64);
        assert!(connection.send(payload).await);
    }
    eventually(|| engine.metrics().trades_accepted == 4).await;

    tokio::time::sleep(Duration::from_secs(1)).await;

    let updates = std::iter::from_fn(|| subscription.try_recv())
        .filter(|update| !matches!(update, Update::Status { .. }))
        .collect::<Vec<_>>();
    assert_eq!(updates.len(), 2);

    match &updates[0] {
        Update::Candle(update) => {
            assert_eq!(update.candle.trade_count, 4);
            assert_eq!(update.candle.high, 12.0);
            assert_eq!(update.candle.close, 11.5);
        }
        other => panic!("expected candle update, got {other:?}"),
    }
    match &updates[1] {
        Update::Trade(tick) => assert_eq!(tick.price, 11.5),
        other => panic!("expected trade tick, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_instruments_are_evicted() {
    let engine = Engine::new(
        config().with_instrument_idle_timeout(Some(Duration::from_secs(10))),
    )
    .unwrap();
    let (_handle, connection, _status) = connected_feed(&engine, "canonical").await;

    assert!(connection.send(trade("XRPUSDT", 0, 0.5, 10.0, 1)).await);
    eventually(|| engine.metrics().trades_accepted == 1).await;
    assert_eq!(engine.instruments().len(), 1);

    // Keep the connection alive while the instrument idles
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(connection.keep_alive().await);
    }

    assert!(engine.instruments().is_empty());
    assert_eq!(engine.metrics().instruments_evicted, 1);
    assert_eq!(engine.latest_price(&InstrumentId::new("XRPUSDT")), None);
}

#[tokio::test]
async fn test_engine_errors() {
    let engine = Engine::new(config()).unwrap();
    let btc = InstrumentId::new("BTCUSDT");

    assert_eq!(
        engine.snapshot(&btc, 300, 10),
        Err(EngineError::UnknownInterval(300))
    );
    assert_eq!(engine.snapshot(&btc, 60, 10), Ok(vec![]));
    assert!(matches!(
        engine.subscribe(btc, 300),
        Err(EngineError::UnknownInterval(300))
    ));
    assert_eq!(
        engine.add_venue_feed(SourceId::new("local"), Venue::Canonical, None, &["BTCUSDT"]),
        Err(EngineError::MissingUrl("canonical".to_string()))
    );

    let (transport, _handle) = ChannelTransport::new("a");
    engine
        .add_feed(SourceId::new("a"), transport, CanonicalParser)
        .unwrap();
    let (transport, _handle) = ChannelTransport::new("a");
    assert_eq!(
        engine.add_feed(SourceId::new("a"), transport, CanonicalParser),
        Err(EngineError::DuplicateFeed(SourceId::new("a")))
    );

    assert!(Engine::new(config().with_intervals(vec![])).is_err());
}

#[tokio::test]
async fn test_shutdown_closes_feeds() {
    let engine = Engine::new(config()).unwrap();
    let mut subscription = engine.subscribe(InstrumentId::new("BTCUSDT"), 60).unwrap();
    let (handle, connection, _status) = connected_feed(&engine, "canonical").await;

    assert!(connection.send(trade("BTCUSDT", 0, 10.0, 1.0, 1)).await);
    eventually(|| engine.metrics().trades_accepted == 1).await;

    engine.shutdown().await;

    assert!(engine.feeds().is_empty());
    eventually(|| connection.is_closed()).await;
    assert_eq!(handle.attempts(), 1);

    let statuses = std::iter::from_fn(|| subscription.try_recv())
        .filter_map(|update| match update {
            Update::Status { status, .. } => Some(status),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(statuses.last(), Some(&FeedStatus::Closed));

    let (transport, _handle) = ChannelTransport::new("late");
    assert_eq!(
        engine.add_feed(SourceId::new("late"), transport, CanonicalParser),
        Err(EngineError::ShutDown)
    );
    assert_eq!(engine.snapshot(&InstrumentId::new("BTCUSDT"), 60, 10).unwrap().len(), 1);
}
