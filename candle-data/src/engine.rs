use crate::{
    candle::Candle,
    config::EngineConfig,
    error::EngineError,
    exchange::Venue,
    hub::{Subscription, SubscriptionHub, SubscriptionId, run_flusher},
    instrument::{InstrumentId, SourceId},
    metrics::{EngineMetrics, MetricsSnapshot},
    normalizer::{TradeNormalizer, TradeParser},
    store::{ApplyOutcome, InstrumentStore, StoreConfig},
    streams::reconnect::{FeedCommand, FeedStatus, Supervisor, SupervisorChannels, stopped},
    trade::Trade,
    transport::{Transport, websocket::WebSocketTransport},
};
use bytes::Bytes;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

/// Handles of the tasks serving one feed.
#[derive(Debug)]
struct FeedHandle {
    stop_tx: watch::Sender<bool>,
    command_tx: mpsc::UnboundedSender<FeedCommand>,
    status_rx: watch::Receiver<FeedStatus>,
    supervisor: JoinHandle<()>,
    ingest: JoinHandle<()>,
    status_forwarder: JoinHandle<()>,
}

impl FeedHandle {
    /// Stop the feed and wait until every buffered payload has been aggregated.
    async fn close(self, source: &SourceId) {
        let _ = self.stop_tx.send(true);

        for (task, handle) in [
            ("supervisor", self.supervisor),
            ("ingest", self.ingest),
            ("status", self.status_forwarder),
        ] {
            if let Err(error) = handle.await {
                warn!(%source, task, %error, "feed task terminated abnormally");
            }
        }
    }
}

/// Real-time trade ingestion and candle aggregation engine.
///
/// Owns the [`InstrumentStore`], the [`SubscriptionHub`] and, per feed, a reconnection
/// [`Supervisor`] task plus an ingest task that normalises and aggregates its payloads.
///
/// Must be constructed inside a tokio runtime.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    intervals: Vec<u32>,
    store: Arc<InstrumentStore>,
    hub: Arc<SubscriptionHub>,
    metrics: Arc<EngineMetrics>,
    feeds: Mutex<FnvHashMap<SourceId, FeedHandle>>,
    shut_down: AtomicBool,
    background_stop_tx: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let metrics = Arc::new(EngineMetrics::default());
        let intervals = config.intervals();
        let store = Arc::new(InstrumentStore::new(StoreConfig {
            intervals_seconds: intervals.clone(),
            max_candles_per_series: config.max_candles_per_series,
            max_recent_trades: config.max_recent_trades,
        }));
        let hub = Arc::new(SubscriptionHub::new(
            config.coalesce_window(),
            config.observer_buffer_size,
            Arc::clone(&metrics),
        ));

        let (background_stop_tx, background_stop_rx) = watch::channel(false);
        let mut background = vec![tokio::spawn(run_flusher(
            Arc::clone(&hub),
            background_stop_rx.clone(),
        ))];
        if let Some(idle) = config.instrument_idle_timeout() {
            background.push(tokio::spawn(run_janitor(
                Arc::clone(&store),
                Arc::clone(&metrics),
                idle,
                background_stop_rx,
            )));
        }

        info!(
            ?intervals,
            max_candles = config.max_candles_per_series,
            coalesce_window_ms = config.coalesce_window_ms,
            "candle engine started"
        );

        Ok(Self {
            config,
            intervals,
            store,
            hub,
            metrics,
            feeds: Mutex::new(FnvHashMap::default()),
            shut_down: AtomicBool::new(false),
            background_stop_tx,
            background: Mutex::new(background),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Configured intervals, ascending.
    pub fn intervals(&self) -> &[u32] {
        &self.intervals
    }

    /// Start ingesting a feed through a caller supplied [`Transport`] and [`TradeParser`].
    pub fn add_feed<T, P>(&self, source: SourceId, transport: T, parser: P) -> Result<(), EngineError>
    where
        T: Transport,
        P: TradeParser,
    {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }

        let mut feeds = self.feeds.lock();
        if feeds.contains_key(&source) {
            return Err(EngineError::DuplicateFeed(source));
        }

        let (payload_tx, payload_rx) = mpsc::channel::<Bytes>(self.config.ingest_buffer_size);
        let (status_tx, status_rx) = watch::channel(FeedStatus::Connecting);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        info!(%source, endpoint = transport.endpoint(), "adding feed");

        let supervisor = Supervisor::new(
            source.clone(),
            transport,
            self.config.reconnect.clone(),
            self.config.stale_timeout(),
            SupervisorChannels {
                payload_tx,
                status_tx,
                command_rx,
                stop_rx,
            },
            Arc::clone(&self.metrics),
        );

        let normalizer = TradeNormalizer::new(source.clone(), parser, self.config.dedup_capacity);

        let handle = FeedHandle {
            stop_tx,
            command_tx,
            status_rx: status_rx.clone(),
            supervisor: tokio::spawn(supervisor.run()),
            ingest: tokio::spawn(run_ingest(
                normalizer,
                payload_rx,
                Arc::clone(&self.store),
                Arc::clone(&self.hub),
                Arc::clone(&self.metrics),
            )),
            status_forwarder: tokio::spawn(run_status_forwarder(
                source.clone(),
                status_rx,
                Arc::clone(&self.hub),
            )),
        };

        feeds.insert(source, handle);
        Ok(())
    }

    /// Start ingesting a built-in venue over WebSocket, subscribing to the trades of `symbols`.
    ///
    /// `url` overrides the venue's default endpoint.
    pub fn add_venue_feed<S>(
        &self,
        source: SourceId,
        venue: Venue,
        url: Option<&str>,
        symbols: &[S],
    ) -> Result<(), EngineError>
    where
        S: AsRef<str>,
    {
        let url = url
            .or(venue.default_url())
            .ok_or_else(|| EngineError::MissingUrl(venue.to_string()))?;

        let transport = WebSocketTransport::new(url)?
            .with_subscriptions(venue.subscribe_requests(symbols))
            .with_ping(self.config.ping_interval(), venue.ping());

        self.add_feed(source, transport, venue.parser())
    }

    /// Copy of the newest `max_candles` candles of an instrument and interval, ascending.
    pub fn snapshot(
        &self,
        instrument: &InstrumentId,
        interval_seconds: u32,
        max_candles: usize,
    ) -> Result<Vec<Candle>, EngineError> {
        self.ensure_interval(interval_seconds)?;
        Ok(self
            .store
            .snapshot(instrument, interval_seconds, max_candles))
    }

    pub fn latest_price(&self, instrument: &InstrumentId) -> Option<f64> {
        self.store.latest_price(instrument)
    }

    /// Copy of the newest `limit` trades of an instrument, in arrival order.
    pub fn recent_trades(&self, instrument: &InstrumentId, limit: usize) -> Vec<Trade> {
        self.store.recent_trades(instrument, limit)
    }

    pub fn instruments(&self) -> Vec<InstrumentId> {
        self.store.instruments()
    }

    pub fn feed_status(&self, source: &SourceId) -> Option<FeedStatus> {
        self.feeds
            .lock()
            .get(source)
            .map(|feed| *feed.status_rx.borrow())
    }

    /// Status of every feed, sorted by source.
    pub fn feeds(&self) -> Vec<(SourceId, FeedStatus)> {
        let mut feeds = self
            .feeds
            .lock()
            .iter()
            .map(|(source, feed)| (source.clone(), *feed.status_rx.borrow()))
            .collect::<Vec<_>>();
        feeds.sort();
        feeds
    }

    /// Watch the status of a feed.
    pub fn watch_feed(&self, source: &SourceId) -> Option<watch::Receiver<FeedStatus>> {
        self.feeds
            .lock()
            .get(source)
            .map(|feed| feed.status_rx.clone())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn subscribe(
        &self,
        instrument: InstrumentId,
        interval_seconds: u32,
    ) -> Result<Subscription, EngineError> {
        self.ensure_interval(interval_seconds)?;
        Ok(self.hub.subscribe(instrument, interval_seconds))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    /// Close an open circuit (or skip a pending backoff) and reconnect the feed immediately.
    pub fn reset_feed(&self, source: &SourceId) -> Result<(), EngineError> {
        let feeds = self.feeds.lock();
        let feed = feeds
            .get(source)
            .ok_or_else(|| EngineError::UnknownFeed(source.clone()))?;

        feed.command_tx
            .send(FeedCommand::Reset)
            .map_err(|_| EngineError::UnknownFeed(source.clone()))
    }

    /// Close a feed. Once this returns no reconnect is attempted and every payload received
    /// before the close has been aggregated.
    pub async fn close_feed(&self, source: &SourceId) -> Result<(), EngineError> {
        let feed = self
            .feeds
            .lock()
            .remove(source)
            .ok_or_else(|| EngineError::UnknownFeed(source.clone()))?;

        feed.close(source).await;
        info!(%source, "feed closed");
        Ok(())
    }

    /// Stop every feed, drain in-flight payloads, deliver pending notifications and stop the
    /// background tasks.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("candle engine shutting down");

        let feeds = std::mem::take(&mut *self.feeds.lock());
        for (source, feed) in feeds {
            feed.close(&source).await;
        }

        let _ = self.background_stop_tx.send(true);
        let background = std::mem::take(&mut *self.background.lock());
        for handle in background {
            if let Err(error) = handle.await {
                warn!(%error, "background task terminated abnormally");
            }
        }

        info!(metrics = ?self.metrics.snapshot(), "candle engine stopped");
    }

    fn ensure_interval(&self, interval_seconds: u32) -> Result<(), EngineError> {
        if self.intervals.contains(&interval_seconds) {
            Ok(())
        } else {
            Err(EngineError::UnknownInterval(interval_seconds))
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for feed in self.feeds.get_mut().values() {
            let _ = feed.stop_tx.send(true);
        }
        let _ = self.background_stop_tx.send(true);
    }
}

/// Normalise, aggregate and publish every payload of one feed.
///
/// Runs until the feed's supervisor drops its payload sender, so payloads already buffered when
/// a feed is closed are still aggregated.
async fn run_ingest(
    mut normalizer: TradeNormalizer,
    mut payload_rx: mpsc::Receiver<Bytes>,
    store: Arc<InstrumentStore>,
    hub: Arc<SubscriptionHub>,
    metrics: Arc<EngineMetrics>,
) {
    while let Some(payload) = payload_rx.recv().await {
        metrics.payloads_received.inc();

        let normalized = normalizer.normalize(&payload);
        if normalized.keep_alive {
            metrics.keep_alives.inc();
        }
        for reason in &normalized.rejected {
            metrics.record_reject(reason.code());
        }
        metrics.duplicates.add(normalized.duplicates as u64);

        for trade in normalized.trades {
            match store.apply(&trade) {
                ApplyOutcome::Applied(outcome) => {
                    if !outcome.late_intervals.is_empty() {
                        metrics.late_trades.inc();
                        debug!(
                            instrument = %trade.instrument,
                            timestamp_millis = trade.timestamp_millis,
                            intervals = ?outcome.late_intervals,
                            "late trade outside retention window"
                        );
                    }
                    if outcome.is_late_everywhere() {
                        continue;
                    }

                    metrics.trades_accepted.inc();
                    for update in outcome.updated {
                        hub.publish_candle(update);
                    }
                    hub.publish_trade(&trade);
                }
                ApplyOutcome::Reset(_) => metrics.invariant_resets.inc(),
            }
        }
    }

    debug!(source = %normalizer.source(), "ingest drained");
}

async fn run_status_forwarder(
    source: SourceId,
    mut status_rx: watch::Receiver<FeedStatus>,
    hub: Arc<SubscriptionHub>,
) {
    while status_rx.changed().await.is_ok() {
        let status = *status_rx.borrow_and_update();
        hub.publish_status(&source, status);
    }
}

/// Periodically evict instruments that have not traded within `idle`.
async fn run_janitor(
    store: Arc<InstrumentStore>,
    metrics: Arc<EngineMetrics>,
    idle: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let period = (idle / 2).max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop_rx) => break,
            _ = interval.tick() => {
                let evicted = store.evict_idle(Instant::now(), idle);
                if !evicted.is_empty() {
                    metrics.instruments_evicted.add(evicted.len() as u64);
                    info!(?evicted, idle_ms = idle.as_millis() as u64, "evicted idle instruments");
                }
            }
        }
    }
}
