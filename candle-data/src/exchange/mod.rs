use crate::{
    normalizer::{RejectReason, TradeParser},
    transport::websocket::PingFrame,
};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `Binance` spot trade stream parser and connection metadata.
pub mod binance;

/// `Bybit` v5 public trade stream parser and connection metadata.
pub mod bybit;

/// Venue neutral JSON trade envelope.
pub mod canonical;

/// `Okx` v5 public trade stream parser and connection metadata.
pub mod okx;

/// Built-in upstream trade feed formats.
///
/// Each venue knows how to parse its trade payloads, where to connect by default, which text
/// frames subscribe to a set of symbols and how to keep the connection alive.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    #[display("binance")]
    Binance,
    #[display("bybit")]
    Bybit,
    #[display("okx")]
    Okx,
    #[display("canonical")]
    Canonical,
}

impl Venue {
    /// Construct the [`TradeParser`] for this venue's wire format.
    pub fn parser(&self) -> Box<dyn TradeParser> {
        match self {
            Venue::Binance => Box::new(binance::BinanceParser),
            Venue::Bybit => Box::new(bybit::BybitParser),
            Venue::Okx => Box::new(okx::OkxParser),
            Venue::Canonical => Box::new(canonical::CanonicalParser),
        }
    }

    /// Default public WebSocket endpoint, if the venue has one.
    pub fn default_url(&self) -> Option<&'static str> {
        match self {
            Venue::Binance => Some(binance::BASE_URL_BINANCE_SPOT),
            Venue::Bybit => Some(bybit::BASE_URL_BYBIT_SPOT),
            Venue::Okx => Some(okx::BASE_URL_OKX),
            Venue::Canonical => None,
        }
    }

    /// Text frames sent after every (re)connect to subscribe to the trades of `symbols`.
    pub fn subscribe_requests<S>(&self, symbols: &[S]) -> Vec<String>
    where
        S: AsRef<str>,
    {
        if symbols.is_empty() {
            return Vec::new();
        }

        match self {
            Venue::Binance => binance::subscribe_requests(symbols),
            Venue::Bybit => bybit::subscribe_requests(symbols),
            Venue::Okx => okx::subscribe_requests(symbols),
            Venue::Canonical => Vec::new(),
        }
    }

    /// Frame the transport sends periodically to keep the connection alive.
    pub fn ping(&self) -> PingFrame {
        match self {
            Venue::Binance | Venue::Canonical => PingFrame::Protocol,
            Venue::Bybit => PingFrame::Text(bybit::PING_BYBIT),
            Venue::Okx => PingFrame::Text(okx::PING_OKX),
        }
    }
}

/// Decode a payload into a loosely typed JSON [`Value`] for envelope classification.
pub(crate) fn parse_value(payload: &[u8]) -> Result<Value, RejectReason> {
    let text = std::str::from_utf8(payload).map_err(|_| RejectReason::InvalidUtf8)?;
    serde_json::from_str::<Value>(text).map_err(|error| RejectReason::MalformedJson(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::Parsed;

    #[test]
    fn test_venue_subscribe_requests() {
        struct TestCase {
            venue: Venue,
            symbols: Vec<&'static str>,
            expected: Vec<Value>,
        }

        let tests = vec![
            TestCase {
                // TC0: Bybit topics
                venue: Venue::Bybit,
                symbols: vec!["BTCUSDT", "ETHUSDT"],
                expected: vec![serde_json::json!({
                    "op": "subscribe",
                    "args": ["publicTrade.BTCUSDT", "publicTrade.ETHUSDT"]
                })],
            },
            TestCase {
                // TC1: Okx instIds
                venue: Venue::Okx,
                symbols: vec!["BTC-USDT"],
                expected: vec![serde_json::json!({
                    "op": "subscribe",
                    "args": [{"channel": "trades", "instId": "BTC-USDT"}]
                })],
            },
            TestCase {
                // TC2: Binance lower-cased stream names
                venue: Venue::Binance,
                symbols: vec!["BTCUSDT"],
                expected: vec![serde_json::json!({
                    "method": "SUBSCRIBE",
                    "params": ["btcusdt@trade"],
                    "id": 1
                })],
            },
            TestCase {
                // TC3: canonical feeds need no subscription
                venue: Venue::Canonical,
                symbols: vec!["BTCUSDT"],
                expected: vec![],
            },
            TestCase {
                // TC4: no symbols, no frames
                venue: Venue::Bybit,
                symbols: vec![],
                expected: vec![],
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test
                .venue
                .subscribe_requests(&test.symbols)
                .into_iter()
                .map(|frame| serde_json::from_str::<Value>(&frame).unwrap())
                .collect::<Vec<_>>();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_venue_parser_rejects_garbage() {
        for venue in [Venue::Binance, Venue::Bybit, Venue::Okx, Venue::Canonical] {
            let parser = venue.parser();
            assert_eq!(
                parser.parse(&[0xff, 0x00]),
                Err(RejectReason::InvalidUtf8),
                "{venue} failed"
            );
            assert!(
                matches!(
                    parser.parse(b"{not json"),
                    Err(RejectReason::MalformedJson(_))
                ),
                "{venue} failed"
            );
            assert_ne!(parser.parse(b"{}"), Ok(Parsed::Trades(vec![])), "{venue} failed");
        }
    }

    #[test]
    fn test_venue_de() {
        let actual = serde_json::from_str::<Vec<Venue>>(r#"["bybit", "okx", "binance", "canonical"]"#)
            .unwrap();
        assert_eq!(
            actual,
            vec![Venue::Bybit, Venue::Okx, Venue::Binance, Venue::Canonical]
        );
    }
}
