use crate::{
    de::{de_str, de_str_or_i64},
    trade::Side,
};
use serde::{Deserialize, Serialize};

/// `Bybit` real-time trades WebSocket message.
///
/// ### Raw Payload Examples
/// See docs: <https://bybit-exchange.github.io/docs/v5/websocket/public/trade>
/// ```json
/// {
///     "topic": "publicTrade.BTCUSDT",
///     "type": "snapshot",
///     "ts": 1672304486868,
///     "data": [ ... ]
/// }
/// ```
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct BybitTrades {
    pub topic: String,

    #[serde(rename = "ts", deserialize_with = "de_str_or_i64")]
    pub time: i64,

    pub data: Vec<BybitTradeInner>,
}

/// ### Raw Payload Examples
/// Spot Side::Buy Trade
///```json
/// {
///     "T": 1672304486865,
///     "s": "BTCUSDT",
///     "S": "Buy",
///     "v": "0.001",
///     "p": "16578.50",
///     "L": "PlusTick",
///     "i": "20f43950-d8dd-5b31-9112-a178eb6023af",
///     "BT": false
/// }
/// ```
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct BybitTradeInner {
    #[serde(alias = "T", deserialize_with = "de_str_or_i64")]
    pub time: i64,

    #[serde(rename = "s")]
    pub market: String,

    #[serde(rename = "S")]
    pub side: Side,

    #[serde(alias = "v", deserialize_with = "de_str")]
    pub amount: f64,

    #[serde(alias = "p", deserialize_with = "de_str")]
    pub price: f64,

    #[serde(rename = "i")]
    pub id: String,
}
