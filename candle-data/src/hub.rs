//! Fan-out of candle updates, trade ticks and feed status to subscribers.
//!
//! Subscribers register for an `(instrument, interval)` pair and receive [`Update`]s through a
//! bounded queue. Candle updates and trade ticks are coalesced: within one coalescing window
//! only the latest state of each touched bucket (and the latest trade) is delivered. Feed
//! status changes bypass coalescing and reach every subscriber.

use crate::{
    aggregator::CandleUpdate,
    instrument::{InstrumentId, SourceId},
    metrics::EngineMetrics,
    streams::reconnect::{FeedStatus, stopped},
    trade::{Trade, TradeTick},
};
use derive_more::Display;
use fnv::FnvHashMap;
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Unique identifier of a [`Subscription`].
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
pub struct SubscriptionId(pub u64);

/// Notification delivered to a subscriber.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Update {
    Candle(CandleUpdate),
    Trade(TradeTick),
    Status { source: SourceId, status: FeedStatus },
}

/// Receiving end of a subscription, also usable as a [`Stream`] of [`Update`]s.
///
/// Dropping it removes the subscription at the next delivery attempt, subscribe or flush.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub instrument: InstrumentId,
    pub interval_seconds: u32,
    receiver: mpsc::Receiver<Update>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Update> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Update> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Update;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

type Key = (InstrumentId, u32);

#[derive(Debug)]
struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<Update>,
}

#[derive(Debug, Default)]
struct Pending {
    /// Latest update per bucket start, so an amended earlier bucket is not lost behind the
    /// current one.
    candles: BTreeMap<i64, CandleUpdate>,
    trade: Option<TradeTick>,
}

#[derive(Debug, Default)]
struct HubState {
    subscribers: FnvHashMap<Key, Vec<Subscriber>>,
    keys: FnvHashMap<SubscriptionId, Key>,
    pending: FnvHashMap<Key, Pending>,
}

/// Routes updates to subscribers, see the module docs.
#[derive(Debug)]
pub struct SubscriptionHub {
    state: Mutex<HubState>,
    coalesce_window: Duration,
    buffer_size: usize,
    next_id: AtomicU64,
    metrics: Arc<EngineMetrics>,
}

impl SubscriptionHub {
    pub fn new(coalesce_window: Duration, buffer_size: usize, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            coalesce_window,
            buffer_size: buffer_size.max(1),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn coalesce_window(&self) -> Duration {
        self.coalesce_window
    }

    pub fn subscribe(&self, instrument: InstrumentId, interval_seconds: u32) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, receiver) = mpsc::channel(self.buffer_size);
        let key = (instrument.clone(), interval_seconds);

        let mut state = self.state.lock();
        prune_closed(&mut state);
        state
            .subscribers
            .entry(key.clone())
            .or_default()
            .push(Subscriber { id, tx });
        state.keys.insert(id, key);
        drop(state);

        debug!(%id, %instrument, interval_seconds, "subscribed");
        Subscription {
            id,
            instrument,
            interval_seconds,
            receiver,
        }
    }

    /// Remove a subscription. Nothing is delivered to it once this returns.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        let Some(key) = state.keys.remove(&id) else {
            return false;
        };
        remove_subscriber(&mut state, &key, id);
        debug!(%id, instrument = %key.0, interval_seconds = key.1, "unsubscribed");
        true
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().keys.len()
    }

    /// Publish a touched candle to subscribers of its instrument and interval.
    pub fn publish_candle(&self, update: CandleUpdate) {
        let key = (update.instrument.clone(), update.interval_seconds);
        let mut state = self.state.lock();
        if !state.subscribers.contains_key(&key) {
            return;
        }

        if self.coalesce_window.is_zero() {
            self.deliver(&mut state, &key, Update::Candle(update));
        } else {
            state
                .pending
                .entry(key)
                .or_default()
                .candles
                .insert(update.candle.bucket_start_millis, update);
        }
    }

    /// Publish a trade tick to subscribers of its instrument, for every interval.
    pub fn publish_trade(&self, trade: &Trade) {
        let mut state = self.state.lock();
        let keys = state
            .subscribers
            .keys()
            .filter(|(instrument, _)| *instrument == trade.instrument)
            .cloned()
            .collect::<Vec<_>>();

        for key in keys {
            let tick = TradeTick::from(trade);
            if self.coalesce_window.is_zero() {
                self.deliver(&mut state, &key, Update::Trade(tick));
            } else {
                state.pending.entry(key).or_default().trade = Some(tick);
            }
        }
    }

    /// Broadcast a feed status change to every subscriber, immediately.
    pub fn publish_status(&self, source: &SourceId, status: FeedStatus) {
        let mut state = self.state.lock();
        let keys = state.subscribers.keys().cloned().collect::<Vec<_>>();
        for key in keys {
            self.deliver(
                &mut state,
                &key,
                Update::Status {
                    source: source.clone(),
                    status,
                },
            );
        }
    }

    /// Deliver every pending coalesced update.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        prune_closed(&mut state);
        if state.pending.is_empty() {
            return;
        }

        let pending = std::mem::take(&mut state.pending);
        for (key, pending) in pending {
            for (_, update) in pending.candles {
                self.deliver(&mut state, &key, Update::Candle(update));
            }
            if let Some(tick) = pending.trade {
                self.deliver(&mut state, &key, Update::Trade(tick));
            }
        }
    }

    fn deliver(&self, state: &mut HubState, key: &Key, update: Update) {
        let Some(subscribers) = state.subscribers.get(key) else {
            return;
        };

        let mut closed = Vec::new();
        for subscriber in subscribers {
            match subscriber.tx.try_send(update.clone()) {
                Ok(()) => self.metrics.notifications_sent.inc(),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.notifications_dropped.inc();
                    warn!(
                        id = %subscriber.id,
                        instrument = %key.0,
                        interval_seconds = key.1,
                        "subscriber queue full, dropping notification"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(subscriber.id),
            }
        }

        for id in closed {
            debug!(%id, "subscriber receiver dropped, removing subscription");
            state.keys.remove(&id);
            remove_subscriber(state, key, id);
        }
    }
}

/// Remove subscribers whose [`Subscription`] was dropped without unsubscribing.
fn prune_closed(state: &mut HubState) {
    let closed = state
        .subscribers
        .iter()
        .flat_map(|(key, subscribers)| {
            subscribers
                .iter()
                .filter(|subscriber| subscriber.tx.is_closed())
                .map(move |subscriber| (key.clone(), subscriber.id))
        })
        .collect::<Vec<_>>();

    for (key, id) in closed {
        debug!(%id, "subscriber receiver dropped, removing subscription");
        state.keys.remove(&id);
        remove_subscriber(state, &key, id);
    }
}

fn remove_subscriber(state: &mut HubState, key: &Key, id: SubscriptionId) {
    if let Some(subscribers) = state.subscribers.get_mut(key) {
        subscribers.retain(|subscriber| subscriber.id != id);
        if subscribers.is_empty() {
            state.subscribers.remove(key);
            state.pending.remove(key);
        }
    }
}

/// Flush the hub every coalescing window until stopped, then flush one final time.
pub async fn run_flusher(hub: Arc<SubscriptionHub>, mut stop_rx: watch::Receiver<bool>) {
    let window = hub.coalesce_window();
    if window.is_zero() {
        return;
    }

    let mut interval = tokio::time::interval(window);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop_rx) => break,
            _ = interval.tick() => hub.flush(),
        }
    }

    hub.flush();
    debug!("subscription hub flusher stopped");
}
