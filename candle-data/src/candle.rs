use crate::{instrument::SourceId, trade::Trade};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::cmp::Ordering;
use thiserror::Error;

/// Start of the bucket containing `timestamp_millis` for a bucket width of `interval_millis`.
///
/// Uses floored division so pre-epoch timestamps still land in the bucket to their left.
#[inline]
pub fn bucket_start(timestamp_millis: i64, interval_millis: i64) -> i64 {
    timestamp_millis.div_euclid(interval_millis) * interval_millis
}

/// Convert an interval in seconds into milliseconds.
#[inline]
pub fn interval_millis(interval_seconds: u32) -> i64 {
    i64::from(interval_seconds) * 1_000
}

/// OHLCV candle for one instrument, one interval and one bucket.
///
/// A candle is mutable while open (the newest candle of a series) and is only ever touched again
/// once closed when an out-of-order trade amends it.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Candle {
    pub interval_seconds: u32,
    pub bucket_start_millis: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: u64,
    pub is_closed: bool,
    /// Earliest trade folded in, which determines `open`.
    pub first_trade: TradeOrder,
    /// Latest trade folded in, which determines `close`.
    pub last_trade: TradeOrder,
}

/// Position of a trade in the total order used to pick a candle's `open` and `close`.
///
/// Trades compare by timestamp, then source, then sequence, then price. Trades sharing a
/// timestamp therefore resolve to the same `open` and `close` whatever order they arrive in.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct TradeOrder {
    pub timestamp_millis: i64,
    pub source: SourceId,
    pub sequence: Option<SmolStr>,
    pub price: f64,
}

impl TradeOrder {
    pub fn cmp_total(&self, other: &Self) -> Ordering {
        self.timestamp_millis
            .cmp(&other.timestamp_millis)
            .then_with(|| self.source.cmp(&other.source))
            .then_with(|| self.sequence.cmp(&other.sequence))
            .then_with(|| self.price.total_cmp(&other.price))
    }
}

impl From<&Trade> for TradeOrder {
    fn from(trade: &Trade) -> Self {
        Self {
            timestamp_millis: trade.timestamp_millis,
            source: trade.source.clone(),
            sequence: trade.sequence.clone(),
            price: trade.price,
        }
    }
}

impl Candle {
    /// Open a new candle from the first trade seen in a bucket.
    pub fn open_with(interval_seconds: u32, bucket_start_millis: i64, trade: &Trade) -> Self {
        let order = TradeOrder::from(trade);
        Self {
            interval_seconds,
            bucket_start_millis,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.quantity,
            trade_count: 1,
            is_closed: false,
            first_trade: order.clone(),
            last_trade: order,
        }
    }

    /// Fold a trade into this candle.
    ///
    /// `open` and `close` follow [`TradeOrder`] rather than arrival order, so folding the same
    /// set of trades in any order yields the same candle.
    pub fn fold(&mut self, trade: &Trade) {
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        self.volume += trade.quantity;
        self.trade_count += 1;

        let order = TradeOrder::from(trade);

        if order.cmp_total(&self.first_trade) == Ordering::Less {
            self.open = trade.price;
            self.first_trade = order.clone();
        }

        if order.cmp_total(&self.last_trade) == Ordering::Greater {
            self.close = trade.price;
            self.last_trade = order;
        }
    }

    /// Check the OHLCV invariants:
    /// - every price is finite and > 0
    /// - `low <= open <= high` and `low <= close <= high`
    /// - `volume` is finite and >= 0
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|price| !price.is_finite() || *price <= 0.0) {
            return Err(InvariantViolation::InvalidPrice);
        }

        if !(self.low <= self.open && self.open <= self.high) {
            return Err(InvariantViolation::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if !(self.low <= self.close && self.close <= self.high) {
            return Err(InvariantViolation::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(InvariantViolation::InvalidVolume(self.volume));
        }

        Ok(())
    }
}

/// Broken OHLCV invariant detected after folding a trade.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvariantViolation {
    #[error("candle contains a non-finite or non-positive price")]
    InvalidPrice,

    #[error("open {open} outside [low {low}, high {high}]")]
    OpenOutOfRange { open: f64, low: f64, high: f64 },

    #[error("close {close} outside [low {low}, high {high}]")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("invalid volume: {0}")]
    InvalidVolume(f64),

    #[error("bucket {bucket_start_millis} is not strictly after previous bucket {previous}")]
    BucketOrder {
        previous: i64,
        bucket_start_millis: i64,
    },
}
