use crate::{de::de_str, trade::Side};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `Binance` combined stream envelope.
///
/// See docs: <https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams#general-wss-information>
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct BinanceCombined {
    pub stream: String,
    pub data: Value,
}

/// `Binance` real-time trade message.
///
/// ### Raw Payload Examples
/// See docs: <https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams#trade-streams>
/// ```json
/// {
///   "e": "trade",
///   "E": 1672515782136,
///   "s": "BNBBTC",
///   "t": 12345,
///   "p": "0.001",
///   "q": "100",
///   "T": 1672515782136,
///   "m": true,
///   "M": true
/// }
/// ```
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct BinanceTrade {
    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "t")]
    pub id: u64,

    #[serde(rename = "p", deserialize_with = "de_str")]
    pub price: f64,

    #[serde(rename = "q", deserialize_with = "de_str")]
    pub amount: f64,

    #[serde(rename = "T")]
    pub time: i64,

    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

impl BinanceTrade {
    /// Aggressor side: a maker buyer means the taker sold.
    pub fn side(&self) -> Side {
        if self.is_buyer_maker {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}
