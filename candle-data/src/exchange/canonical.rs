use crate::{
    de::{de_str_or_f64, de_str_or_i64},
    exchange::parse_value,
    normalizer::{Parsed, RawTrade, RejectReason, TradeParser},
    trade::Side,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::{SmolStr, format_smolstr};

/// Venue neutral trade envelope, either a single object or an array of them.
///
/// ```json
/// {
///     "instrument": "BTC-USDT",
///     "timestamp": 1672304486865,
///     "price": "16578.5",
///     "quantity": 0.25,
///     "side": "buy",
///     "sequence": "42"
/// }
/// ```
///
/// `{"type": "heartbeat"}` is treated as a keep-alive.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct CanonicalTrade {
    pub instrument: SmolStr,

    #[serde(deserialize_with = "de_str_or_i64")]
    pub timestamp: i64,

    #[serde(deserialize_with = "de_str_or_f64")]
    pub price: f64,

    #[serde(deserialize_with = "de_str_or_f64")]
    pub quantity: f64,

    #[serde(default)]
    pub side: Option<Side>,

    #[serde(default)]
    pub sequence: Option<Sequence>,
}

/// Trade sequence encoded as either a string or an integer.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Sequence {
    Number(u64),
    Text(SmolStr),
}

impl From<Sequence> for SmolStr {
    fn from(value: Sequence) -> Self {
        match value {
            Sequence::Number(number) => format_smolstr!("{number}"),
            Sequence::Text(text) => text,
        }
    }
}

impl From<CanonicalTrade> for RawTrade {
    fn from(trade: CanonicalTrade) -> Self {
        Self {
            instrument: trade.instrument,
            timestamp_millis: trade.timestamp,
            price: trade.price,
            quantity: trade.quantity,
            side: trade.side,
            sequence: trade.sequence.map(SmolStr::from),
        }
    }
}

/// [`TradeParser`] for [`CanonicalTrade`] payloads.
#[derive(Copy, Clone, Debug, Default)]
pub struct CanonicalParser;

impl TradeParser for CanonicalParser {
    fn parse(&self, payload: &[u8]) -> Result<Parsed, RejectReason> {
        let value = parse_value(payload)?;

        if value.is_array() {
            let trades = serde_json::from_value::<Vec<CanonicalTrade>>(value)?;
            return Ok(Parsed::Trades(trades.into_iter().map(RawTrade::from).collect()));
        }

        let Some(object) = value.as_object() else {
            return Err(RejectReason::UnknownMessage);
        };

        match object.get("type").and_then(Value::as_str) {
            Some("heartbeat") => return Ok(Parsed::KeepAlive),
            Some("trade") | None => {}
            Some(_) => return Ok(Parsed::Ignored),
        }

        if !object.contains_key("instrument") {
            return Err(RejectReason::UnknownMessage);
        }

        let trade = serde_json::from_value::<CanonicalTrade>(value)?;
        Ok(Parsed::Trades(vec![RawTrade::from(trade)]))
    }
}
