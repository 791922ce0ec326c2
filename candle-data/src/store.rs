//! Per-instrument rolling state.
//!
//! The [`InstrumentStore`] is the only shared mutable resource of the engine. Each instrument's
//! [`InstrumentState`] sits behind its own mutex, so trades for one instrument are folded one at
//! a time while different instruments proceed in parallel. Readers always receive copies.

use crate::{
    aggregator::{AggregateError, AggregateOutcome, CandleAggregator},
    candle::Candle,
    instrument::InstrumentId,
    trade::Trade,
};
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, error};

/// Sizing of every [`InstrumentState`] created by an [`InstrumentStore`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StoreConfig {
    pub intervals_seconds: Vec<u32>,
    pub max_candles_per_series: usize,
    pub max_recent_trades: usize,
}

/// Rolling state of one instrument: latest price, recent trades and candles per interval.
#[derive(Debug)]
pub struct InstrumentState {
    instrument: InstrumentId,
    last_price: Option<f64>,
    last_trade_millis: Option<i64>,
    recent_trades: VecDeque<Trade>,
    max_recent_trades: usize,
    aggregator: CandleAggregator,
    last_update: Instant,
}

impl InstrumentState {
    pub fn new(instrument: InstrumentId, config: &StoreConfig) -> Self {
        let max_recent_trades = config.max_recent_trades.max(1);
        Self {
            aggregator: CandleAggregator::new(
                instrument.clone(),
                &config.intervals_seconds,
                config.max_candles_per_series,
            ),
            instrument,
            last_price: None,
            last_trade_millis: None,
            recent_trades: VecDeque::with_capacity(max_recent_trades.min(1024)),
            max_recent_trades,
            last_update: Instant::now(),
        }
    }

    /// Fold a trade into every candle series and the recent trade ring.
    ///
    /// A trade that is late for every interval is dropped entirely.
    pub fn apply(&mut self, trade: &Trade) -> Result<AggregateOutcome, AggregateError> {
        let outcome = self.aggregator.apply(trade)?;
        if outcome.is_late_everywhere() {
            return Ok(outcome);
        }

        if self
            .last_trade_millis
            .is_none_or(|last| trade.timestamp_millis >= last)
        {
            self.last_trade_millis = Some(trade.timestamp_millis);
            self.last_price = Some(trade.price);
        }

        if self.recent_trades.len() >= self.max_recent_trades {
            self.recent_trades.pop_front();
        }
        self.recent_trades.push_back(trade.clone());
        self.last_update = Instant::now();

        Ok(outcome)
    }

    pub fn instrument(&self) -> &InstrumentId {
        &self.instrument
    }

    /// Price of the trade with the greatest timestamp seen.
    pub fn last_price(&self) -> Option<f64> {
        self.last_price
    }

    pub fn last_trade_millis(&self) -> Option<i64> {
        self.last_trade_millis
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }

    /// Copy of the newest `limit` trades, in arrival order.
    pub fn recent_trades(&self, limit: usize) -> Vec<Trade> {
        let start = self.recent_trades.len().saturating_sub(limit);
        self.recent_trades.range(start..).cloned().collect()
    }

    /// Copy of the newest `max_candles` candles of an interval, ascending by bucket.
    pub fn candles(&self, interval_seconds: u32, max_candles: usize) -> Option<Vec<Candle>> {
        self.aggregator
            .series(interval_seconds)
            .map(|series| series.snapshot(max_candles))
    }

    /// Open candle of an interval.
    pub fn current_candle(&self, interval_seconds: u32) -> Option<Candle> {
        self.aggregator
            .series(interval_seconds)
            .and_then(|series| series.current().cloned())
    }
}

/// Result of [`InstrumentStore::apply`].
#[derive(Clone, PartialEq, Debug)]
pub enum ApplyOutcome {
    Applied(AggregateOutcome),
    /// The trade broke an OHLCV invariant and the instrument's state was reset.
    Reset(AggregateError),
}

/// Holds the [`InstrumentState`] of every instrument seen.
#[derive(Debug)]
pub struct InstrumentStore {
    config: StoreConfig,
    instruments: RwLock<FnvHashMap<InstrumentId, Arc<Mutex<InstrumentState>>>>,
}

impl InstrumentStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            instruments: RwLock::new(FnvHashMap::default()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Fetch the state of an instrument, lazily creating it on first use.
    pub fn get_or_create(&self, instrument: &InstrumentId) -> Arc<Mutex<InstrumentState>> {
        if let Some(state) = self.instruments.read().get(instrument) {
            return Arc::clone(state);
        }

        let mut instruments = self.instruments.write();
        Arc::clone(instruments.entry(instrument.clone()).or_insert_with(|| {
            debug!(%instrument, "tracking new instrument");
            Arc::new(Mutex::new(InstrumentState::new(
                instrument.clone(),
                &self.config,
            )))
        }))
    }

    /// Fold a validated trade into its instrument's state.
    ///
    /// An invariant violation resets that instrument only, never the rest of the store.
    pub fn apply(&self, trade: &Trade) -> ApplyOutcome {
        // The map lock is held (shared) while folding so eviction never races an apply
        let instruments = self.instruments.read();
        if let Some(state) = instruments.get(&trade.instrument) {
            return self.apply_to(&mut state.lock(), trade);
        }
        drop(instruments);

        let mut instruments = self.instruments.write();
        let state = Arc::clone(
            instruments
                .entry(trade.instrument.clone())
                .or_insert_with(|| {
                    debug!(instrument = %trade.instrument, "tracking new instrument");
                    Arc::new(Mutex::new(InstrumentState::new(
                        trade.instrument.clone(),
                        &self.config,
                    )))
                }),
        );
        let _instruments = RwLockWriteGuard::downgrade(instruments);
        self.apply_to(&mut state.lock(), trade)
    }

    fn apply_to(&self, state: &mut InstrumentState, trade: &Trade) -> ApplyOutcome {
        match state.apply(trade) {
            Ok(outcome) => ApplyOutcome::Applied(outcome),
            Err(error) => {
                error!(
                    instrument = %state.instrument,
                    %error,
                    "candle invariant violated, resetting instrument state"
                );
                *state = InstrumentState::new(state.instrument.clone(), &self.config);
                ApplyOutcome::Reset(error)
            }
        }
    }

    /// Copy of the newest `max_candles` candles, ascending by bucket. Empty if unknown.
    pub fn snapshot(
        &self,
        instrument: &InstrumentId,
        interval_seconds: u32,
        max_candles: usize,
    ) -> Vec<Candle> {
        self.with_state(instrument, |state| state.candles(interval_seconds, max_candles))
            .flatten()
            .unwrap_or_default()
    }

    pub fn latest_price(&self, instrument: &InstrumentId) -> Option<f64> {
        self.with_state(instrument, InstrumentState::last_price)
            .flatten()
    }

    pub fn recent_trades(&self, instrument: &InstrumentId, limit: usize) -> Vec<Trade> {
        self.with_state(instrument, |state| state.recent_trades(limit))
            .unwrap_or_default()
    }

    pub fn current_candle(&self, instrument: &InstrumentId, interval_seconds: u32) -> Option<Candle> {
        self.with_state(instrument, |state| state.current_candle(interval_seconds))
            .flatten()
    }

    /// Instruments currently tracked, sorted.
    pub fn instruments(&self) -> Vec<InstrumentId> {
        let mut instruments = self.instruments.read().keys().cloned().collect::<Vec<_>>();
        instruments.sort();
        instruments
    }

    pub fn len(&self) -> usize {
        self.instruments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.read().is_empty()
    }

    /// Drop every instrument without a trade since `now - idle`, returning the evicted ids.
    pub fn evict_idle(&self, now: Instant, idle: Duration) -> Vec<InstrumentId> {
        let mut evicted = Vec::new();
        self.instruments.write().retain(|instrument, state| {
            let keep = now.saturating_duration_since(state.lock().last_update) < idle;
            if !keep {
                evicted.push(instrument.clone());
            }
            keep
        });
        evicted.sort();
        evicted
    }

    fn with_state<F, T>(&self, instrument: &InstrumentId, f: F) -> Option<T>
    where
        F: FnOnce(&InstrumentState) -> T,
    {
        let state = Arc::clone(self.instruments.read().get(instrument)?);
        let state = state.lock();
        Some(f(&state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{aggregator::CandleChange, instrument::SourceId};

    fn store(intervals: &[u32], max_candles: usize, max_recent: usize) -> InstrumentStore {
        InstrumentStore::new(StoreConfig {
            intervals_seconds: intervals.to_vec(),
            max_candles_per_series: max_candles,
            max_recent_trades: max_recent,
        })
    }

    fn trade(instrument: &str, seconds: i64, price: f64, quantity: f64) -> Trade {
        Trade {
            instrument: InstrumentId::new(instrument),
            timestamp_millis: seconds * 1_000,
            price,
            quantity,
            side: None,
            source: SourceId::new("test"),
            sequence: None,
        }
    }

    fn applied(outcome: ApplyOutcome) -> AggregateOutcome {
        match outcome {
            ApplyOutcome::Applied(outcome) => outcome,
            ApplyOutcome::Reset(error) => panic!("unexpected reset: {error}"),
        }
    }

    #[test]
    fn test_store_apply_and_snapshot() {
        let store = store(&[60], 10, 10);
        for input in [
            trade("BTCUSDT", 0, 10.0, 1.0),
            trade("BTCUSDT", 30, 12.0, 2.0),
            trade("BTCUSDT", 61, 9.0, 1.0),
        ] {
            applied(store.apply(&input));
        }

        let instrument = InstrumentId::new("BTCUSDT");
        let candles = store.snapshot(&instrument, 60, 10);
        assert_eq!(candles.len(), 2);
        assert_eq!(
            (candles[0].open, candles[0].high, candles[0].low, candles[0].close, candles[0].volume),
            (10.0, 12.0, 10.0, 12.0, 3.0)
        );
        assert!(candles[0].is_closed);
        assert_eq!(
            (candles[1].open, candles[1].high, candles[1].low, candles[1].close, candles[1].volume),
            (9.0, 9.0, 9.0, 9.0, 1.0)
        );
        assert!(!candles[1].is_closed);

        assert_eq!(store.latest_price(&instrument), Some(9.0));
        assert_eq!(store.snapshot(&instrument, 60, 1), vec![candles[1].clone()]);
    }

    #[test]
    fn test_store_snapshot_is_a_copy() {
        let store = store(&[60], 10, 10);
        applied(store.apply(&trade("BTCUSDT", 0, 10.0, 1.0)));

        let instrument = InstrumentId::new("BTCUSDT");
        let before = store.snapshot(&instrument, 60, 10);
        applied(store.apply(&trade("BTCUSDT", 1, 20.0, 1.0)));

        assert_eq!(before[0].high, 10.0);
        assert_eq!(store.snapshot(&instrument, 60, 10)[0].high, 20.0);
    }

    #[test]
    fn test_store_latest_price_follows_trade_time() {
        let store = store(&[60], 10, 10);
        applied(store.apply(&trade("ETHUSDT", 50, 100.0, 1.0)));
        // Out-of-order trade does not replace the latest price
        applied(store.apply(&trade("ETHUSDT", 10, 90.0, 1.0)));

        assert_eq!(store.latest_price(&InstrumentId::new("ETHUSDT")), Some(100.0));
        assert_eq!(store.latest_price(&InstrumentId::new("SOLUSDT")), None);
    }

    #[test]
    fn test_store_recent_trades_bounded() {
        let store = store(&[60], 10, 3);
        for second in 0..5 {
            applied(store.apply(&trade("BTCUSDT", second, 10.0 + second as f64, 1.0)));
        }

        let instrument = InstrumentId::new("BTCUSDT");
        let prices = store
            .recent_trades(&instrument, 10)
            .into_iter()
            .map(|trade| trade.price)
            .collect::<Vec<_>>();
        assert_eq!(prices, vec![12.0, 13.0, 14.0]);

        let newest = store.recent_trades(&instrument, 1);
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].price, 14.0);
    }

    #[test]
    fn test_store_late_trade_not_recorded() {
        let store = store(&[60], 2, 10);
        applied(store.apply(&trade("BTCUSDT", 600, 10.0, 1.0)));

        let outcome = applied(store.apply(&trade("BTCUSDT", 0, 11.0, 1.0)));
        assert!(outcome.is_late_everywhere());
        assert_eq!(store.recent_trades(&InstrumentId::new("BTCUSDT"), 10).len(), 1);
    }

    #[test]
    fn test_store_instruments_independent() {
        let store = store(&[60, 300], 10, 10);
        let outcome = applied(store.apply(&trade("btc-usdt", 0, 10.0, 1.0)));
        assert_eq!(outcome.updated_intervals(), vec![60, 300]);
        assert!(outcome
            .updated
            .iter()
            .all(|update| update.change == CandleChange::Opened));

        applied(store.apply(&trade("ETH/USDT", 0, 2.0, 1.0)));

        assert_eq!(
            store.instruments(),
            vec![InstrumentId::new("BTCUSDT"), InstrumentId::new("ETHUSDT")]
        );
        assert_eq!(store.latest_price(&InstrumentId::new("BTCUSDT")), Some(10.0));
        assert_eq!(store.latest_price(&InstrumentId::new("ETHUSDT")), Some(2.0));
    }

    #[test]
    fn test_store_unknown_interval_snapshot_empty() {
        let store = store(&[60], 10, 10);
        applied(store.apply(&trade("BTCUSDT", 0, 10.0, 1.0)));
        assert!(store.snapshot(&InstrumentId::new("BTCUSDT"), 300, 10).is_empty());
    }

    #[test]
    fn test_store_reset_on_invariant_violation() {
        let store = store(&[60], 10, 10);
        applied(store.apply(&trade("BTCUSDT", 0, 10.0, 1.0)));
        applied(store.apply(&trade("ETHUSDT", 0, 2.0, 1.0)));

        // Bypasses the normaliser: a NaN price corrupts the candle
        let outcome = store.apply(&trade("BTCUSDT", 1, f64::NAN, 1.0));
        assert!(matches!(outcome, ApplyOutcome::Reset(_)));

        assert!(store.snapshot(&InstrumentId::new("BTCUSDT"), 60, 10).is_empty());
        assert_eq!(store.latest_price(&InstrumentId::new("BTCUSDT")), None);
        assert_eq!(store.latest_price(&InstrumentId::new("ETHUSDT")), Some(2.0));

        applied(store.apply(&trade("BTCUSDT", 2, 11.0, 1.0)));
        assert_eq!(store.snapshot(&InstrumentId::new("BTCUSDT"), 60, 10).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_evict_idle() {
        let store = store(&[60], 10, 10);
        applied(store.apply(&trade("BTCUSDT", 0, 10.0, 1.0)));

        tokio::time::advance(Duration::from_secs(30)).await;
        applied(store.apply(&trade("ETHUSDT", 0, 2.0, 1.0)));

        tokio::time::advance(Duration::from_secs(40)).await;
        let evicted = store.evict_idle(Instant::now(), Duration::from_secs(60));

        assert_eq!(evicted, vec![InstrumentId::new("BTCUSDT")]);
        assert_eq!(store.instruments(), vec![InstrumentId::new("ETHUSDT")]);
    }

    #[test]
    fn test_store_get_or_create() {
        let store = store(&[60], 10, 10);
        let instrument = InstrumentId::new("BTCUSDT");

        let first = store.get_or_create(&instrument);
        let second = store.get_or_create(&instrument);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);
        assert!(first.lock().last_price().is_none());
    }
}
