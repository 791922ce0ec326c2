use crate::instrument::{InstrumentId, SourceId};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Aggressor side of a trade.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
pub enum Side {
    #[display("buy")]
    #[serde(alias = "buy", alias = "BUY", alias = "b", alias = "B")]
    Buy,
    #[display("sell")]
    #[serde(alias = "sell", alias = "SELL", alias = "s", alias = "S")]
    Sell,
}

/// Normalised trade produced once by the [`TradeNormalizer`](crate::normalizer::TradeNormalizer).
///
/// Only validated trades are ever constructed by the engine:
/// - `price` is finite and > 0
/// - `quantity` is finite and >= 0
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Trade {
    pub instrument: InstrumentId,
    pub timestamp_millis: i64,
    pub price: f64,
    pub quantity: f64,
    pub side: Option<Side>,
    pub source: SourceId,
    /// Venue trade id / sequence number / signature used for de-duplication.
    pub sequence: Option<SmolStr>,
}

/// Lightweight view of a [`Trade`] delivered to subscribers.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct TradeTick {
    pub instrument: InstrumentId,
    pub timestamp_millis: i64,
    pub price: f64,
    pub quantity: f64,
    pub side: Option<Side>,
    pub source: SourceId,
}

impl From<&Trade> for TradeTick {
    fn from(trade: &Trade) -> Self {
        Self {
            instrument: trade.instrument.clone(),
            timestamp_millis: trade.timestamp_millis,
            price: trade.price,
            quantity: trade.quantity,
            side: trade.side,
            source: trade.source.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_de() {
        struct TestCase {
            input: &'static str,
            expected: Option<Side>,
        }

        let tests = vec![
            TestCase {
                // TC0: Bybit style
                input: r#""Buy""#,
                expected: Some(Side::Buy),
            },
            TestCase {
                // TC1: OKX style
                input: r#""sell""#,
                expected: Some(Side::Sell),
            },
            TestCase {
                // TC2: upper case
                input: r#""BUY""#,
                expected: Some(Side::Buy),
            },
            TestCase {
                // TC3: unsupported
                input: r#""Unknown""#,
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = serde_json::from_str::<Side>(test.input).ok();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_side_display() {
        assert_eq!(Side::Buy.to_string(), "buy");
        assert_eq!(Side::Sell.to_string(), "sell");
    }
}
