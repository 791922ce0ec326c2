//! Multi-interval OHLCV aggregation.
//!
//! Trades are bucketed by their own timestamp (never wall clock), so the same set of trades
//! produces the same candles regardless of how feeds interleave. Trades that land in an already
//! closed bucket reopen and amend that bucket while it is still inside the retention window,
//! and are rejected as late arrivals otherwise.

use crate::{
    candle::{Candle, InvariantViolation, bucket_start, interval_millis},
    instrument::InstrumentId,
    trade::Trade,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

/// How a trade changed a [`Candle`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandleChange {
    /// First trade of a new bucket opened this candle.
    Opened,
    /// Trade folded into the open candle.
    Updated,
    /// Candle was closed because a newer bucket opened.
    Closed,
    /// Out-of-order trade amended an existing closed candle.
    Amended,
    /// Out-of-order trade created a closed candle for a previously empty bucket.
    Inserted,
}

/// A copy of a [`Candle`] after it was touched by a trade.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct CandleUpdate {
    pub instrument: InstrumentId,
    pub interval_seconds: u32,
    pub change: CandleChange,
    pub candle: Candle,
}

/// Result of folding one trade into one [`CandleSeries`].
#[derive(Clone, PartialEq, Debug)]
pub enum SeriesOutcome {
    Applied(Vec<(CandleChange, Candle)>),
    /// Trade bucket precedes the retention window.
    Late {
        bucket_start_millis: i64,
        oldest_allowed_millis: i64,
    },
}

/// Result of [`CandleAggregator::apply`].
#[derive(Clone, PartialEq, Debug, Default)]
pub struct AggregateOutcome {
    pub updated: Vec<CandleUpdate>,
    /// Intervals for which the trade arrived too late to be folded.
    pub late_intervals: Vec<u32>,
}

impl AggregateOutcome {
    /// Distinct intervals with at least one touched candle.
    pub fn updated_intervals(&self) -> Vec<u32> {
        let mut intervals = self
            .updated
            .iter()
            .map(|update| update.interval_seconds)
            .collect::<Vec<_>>();
        intervals.dedup();
        intervals
    }

    pub fn is_late_everywhere(&self) -> bool {
        self.updated.is_empty() && !self.late_intervals.is_empty()
    }
}

/// Unrecoverable aggregation fault for a single instrument.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregateError {
    #[error("invariant violation for {instrument} @ {interval_seconds}s: {source}")]
    InvariantViolation {
        instrument: InstrumentId,
        interval_seconds: u32,
        #[source]
        source: InvariantViolation,
    },
}

/// Bounded, strictly ordered candle sequence for one instrument and one interval.
///
/// The newest candle is the open one. Candles older than
/// `newest_bucket - (max_candles - 1) * interval` are evicted, which caps the series at
/// `max_candles` entries.
#[derive(Clone, Debug)]
pub struct CandleSeries {
    interval_seconds: u32,
    interval_millis: i64,
    max_candles: usize,
    candles: VecDeque<Candle>,
}

impl CandleSeries {
    pub fn new(interval_seconds: u32, max_candles: usize) -> Self {
        let max_candles = max_candles.max(1);
        Self {
            interval_seconds,
            interval_millis: interval_millis(interval_seconds),
            max_candles,
            candles: VecDeque::with_capacity(max_candles.min(1024)),
        }
    }

    pub fn interval_seconds(&self) -> u32 {
        self.interval_seconds
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Currently open candle.
    pub fn current(&self) -> Option<&Candle> {
        self.candles.back()
    }

    /// Oldest bucket start a trade may still amend, given the newest bucket.
    fn oldest_allowed(&self, newest_bucket_millis: i64) -> i64 {
        let span = (self.max_candles as i64 - 1).saturating_mul(self.interval_millis);
        newest_bucket_millis.saturating_sub(span)
    }

    pub fn apply(&mut self, trade: &Trade) -> Result<SeriesOutcome, InvariantViolation> {
        let bucket = bucket_start(trade.timestamp_millis, self.interval_millis);

        let newest = match self.candles.back_mut() {
            None => {
                let candle = Candle::open_with(self.interval_seconds, bucket, trade);
                candle.validate()?;
                self.candles.push_back(candle.clone());
                return Ok(SeriesOutcome::Applied(vec![(CandleChange::Opened, candle)]));
            }
            Some(current) if current.bucket_start_millis == bucket => {
                current.fold(trade);
                current.validate()?;
                return Ok(SeriesOutcome::Applied(vec![(
                    CandleChange::Updated,
                    current.clone(),
                )]));
            }
            Some(current) => current.bucket_start_millis,
        };

        if bucket > newest {
            let mut changes = Vec::with_capacity(2);
            if let Some(previous) = self.candles.back_mut() {
                previous.is_closed = true;
                changes.push((CandleChange::Closed, previous.clone()));
            }

            let candle = Candle::open_with(self.interval_seconds, bucket, trade);
            candle.validate()?;
            self.candles.push_back(candle.clone());
            self.evict(bucket);
            changes.push((CandleChange::Opened, candle));
            return Ok(SeriesOutcome::Applied(changes));
        }

        let oldest_allowed = self.oldest_allowed(newest);
        if bucket < oldest_allowed {
            return Ok(SeriesOutcome::Late {
                bucket_start_millis: bucket,
                oldest_allowed_millis: oldest_allowed,
            });
        }

        match self
            .candles
            .binary_search_by_key(&bucket, |candle| candle.bucket_start_millis)
        {
            Ok(index) => {
                let candle = &mut self.candles[index];
                candle.fold(trade);
                candle.validate()?;
                Ok(SeriesOutcome::Applied(vec![(
                    CandleChange::Amended,
                    candle.clone(),
                )]))
            }
            Err(index) => {
                let mut candle = Candle::open_with(self.interval_seconds, bucket, trade);
                candle.is_closed = true;
                candle.validate()?;
                self.candles.insert(index, candle.clone());
                self.check_order_around(index)?;
                Ok(SeriesOutcome::Applied(vec![(CandleChange::Inserted, candle)]))
            }
        }
    }

    /// Drop candles that fell out of the retention window of `newest_bucket_millis`.
    fn evict(&mut self, newest_bucket_millis: i64) {
        let oldest_allowed = self.oldest_allowed(newest_bucket_millis);
        while let Some(front) = self.candles.front() {
            if front.bucket_start_millis < oldest_allowed || self.candles.len() > self.max_candles
            {
                self.candles.pop_front();
            } else {
                break;
            }
        }
    }

    fn check_order_around(&self, index: usize) -> Result<(), InvariantViolation> {
        let bucket = self.candles[index].bucket_start_millis;

        if let Some(previous) = index.checked_sub(1).and_then(|i| self.candles.get(i)) {
            if previous.bucket_start_millis >= bucket {
                return Err(InvariantViolation::BucketOrder {
                    previous: previous.bucket_start_millis,
                    bucket_start_millis: bucket,
                });
            }
        }

        if let Some(next) = self.candles.get(index + 1) {
            if bucket >= next.bucket_start_millis {
                return Err(InvariantViolation::BucketOrder {
                    previous: bucket,
                    bucket_start_millis: next.bucket_start_millis,
                });
            }
        }

        Ok(())
    }

    /// Copy of the newest `max_candles` candles in ascending bucket order.
    pub fn snapshot(&self, max_candles: usize) -> Vec<Candle> {
        let start = self.candles.len().saturating_sub(max_candles);
        self.candles.range(start..).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }
}

/// Maintains one [`CandleSeries`] per configured interval for a single instrument.
#[derive(Clone, Debug)]
pub struct CandleAggregator {
    instrument: InstrumentId,
    series: Vec<CandleSeries>,
}

impl CandleAggregator {
    /// Construct a [`CandleAggregator`] for the provided intervals (deduplicated, ascending).
    pub fn new(instrument: InstrumentId, intervals_seconds: &[u32], max_candles: usize) -> Self {
        let mut intervals = intervals_seconds.to_vec();
        intervals.sort_unstable();
        intervals.dedup();

        Self {
            instrument,
            series: intervals
                .into_iter()
                .map(|interval| CandleSeries::new(interval, max_candles))
                .collect(),
        }
    }

    pub fn instrument(&self) -> &InstrumentId {
        &self.instrument
    }

    pub fn series(&self, interval_seconds: u32) -> Option<&CandleSeries> {
        self.series
            .iter()
            .find(|series| series.interval_seconds == interval_seconds)
    }

    pub fn intervals(&self) -> impl Iterator<Item = u32> + '_ {
        self.series.iter().map(CandleSeries::interval_seconds)
    }

    /// Fold a [`Trade`] into every configured interval.
    pub fn apply(&mut self, trade: &Trade) -> Result<AggregateOutcome, AggregateError> {
        let mut outcome = AggregateOutcome::default();

        for series in &mut self.series {
            let interval_seconds = series.interval_seconds;
            let applied = series
                .apply(trade)
                .map_err(|source| AggregateError::InvariantViolation {
                    instrument: self.instrument.clone(),
                    interval_seconds,
                    source,
                })?;

            match applied {
                SeriesOutcome::Applied(changes) => {
                    outcome
                        .updated
                        .extend(changes.into_iter().map(|(change, candle)| CandleUpdate {
                            instrument: self.instrument.clone(),
                            interval_seconds,
                            change,
                            candle,
                        }));
                }
                SeriesOutcome::Late { .. } => outcome.late_intervals.push(interval_seconds),
            }
        }

        Ok(outcome)
    }
}
