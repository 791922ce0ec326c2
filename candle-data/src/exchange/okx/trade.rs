use crate::{
    de::{de_str, de_str_or_i64},
    trade::Side,
};
use serde::{Deserialize, Serialize};

/// `Okx` real-time trades WebSocket message.
///
/// ### Raw Payload Examples
/// See docs: <https://www.okx.com/docs-v5/en/#websocket-api-public-channel-trades-channel>
/// ```json
/// {
///   "arg": {
///     "channel": "trades",
///     "instId": "BTC-USDT"
///   },
///   "data": [
///     {
///       "instId": "BTC-USDT",
///       "tradeId": "130639474",
///       "px": "42219.9",
///       "sz": "0.12060306",
///       "side": "buy",
///       "ts": "1630048897897",
///       "count": "3"
///     }
///   ]
/// }
/// ```
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct OkxTrades {
    pub arg: OkxArg,
    pub data: Vec<OkxTrade>,
}

#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OkxArg {
    pub channel: String,
    pub inst_id: String,
}

#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct OkxTrade {
    #[serde(rename = "instId")]
    pub inst_id: String,

    #[serde(rename = "tradeId")]
    pub id: String,

    #[serde(rename = "px", deserialize_with = "de_str")]
    pub price: f64,

    #[serde(rename = "sz", deserialize_with = "de_str")]
    pub amount: f64,

    pub side: Side,

    #[serde(rename = "ts", deserialize_with = "de_str_or_i64")]
    pub time: i64,
}
