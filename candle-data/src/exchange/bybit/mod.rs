use self::trade::BybitTrades;
use crate::{
    exchange::parse_value,
    normalizer::{Parsed, RawTrade, RejectReason, TradeParser},
};
use serde_json::{Value, json};
use smol_str::SmolStr;

/// Public trade types for `Bybit`.
pub mod trade;

/// `Bybit` spot server base url.
///
/// See docs: <https://bybit-exchange.github.io/docs/v5/ws/connect>
pub const BASE_URL_BYBIT_SPOT: &str = "wss://stream.bybit.com/v5/public/spot";

/// `Bybit` perpetuals and futures server base url.
pub const BASE_URL_BYBIT_PERPETUALS_USD: &str = "wss://stream.bybit.com/v5/public/linear";

/// `Bybit` application level ping, answered with an `"op": "pong"` response.
pub const PING_BYBIT: &str = r#"{"op":"ping"}"#;

/// `Bybit` real-time trades topic prefix.
///
/// See docs: <https://bybit-exchange.github.io/docs/v5/websocket/public/trade>
pub const TOPIC_TRADES: &str = "publicTrade.";

pub(crate) fn subscribe_requests<S>(symbols: &[S]) -> Vec<String>
where
    S: AsRef<str>,
{
    let args = symbols
        .iter()
        .map(|symbol| format!("{TOPIC_TRADES}{}", symbol.as_ref()))
        .collect::<Vec<_>>();

    vec![json!({ "op": "subscribe", "args": args }).to_string()]
}

/// [`TradeParser`] for the `Bybit` v5 `publicTrade` stream.
///
/// Operation responses (subscribe acks, pongs) are treated as keep-alives.
#[derive(Copy, Clone, Debug, Default)]
pub struct BybitParser;

impl TradeParser for BybitParser {
    fn parse(&self, payload: &[u8]) -> Result<Parsed, RejectReason> {
        let value = parse_value(payload)?;

        if value.get("op").is_some() {
            return Ok(Parsed::KeepAlive);
        }

        match value.get("topic").and_then(Value::as_str) {
            Some(topic) if topic.starts_with(TOPIC_TRADES) => {
                let trades = serde_json::from_value::<BybitTrades>(value)?;
                Ok(Parsed::Trades(
                    trades
                        .data
                        .into_iter()
                        .map(|trade| RawTrade {
                            instrument: SmolStr::new(&trade.market),
                            timestamp_millis: trade.time,
                            price: trade.price,
                            quantity: trade.amount,
                            side: Some(trade.side),
                            sequence: Some(SmolStr::new(&trade.id)),
                        })
                        .collect(),
                ))
            }
            Some(_) => Ok(Parsed::Ignored),
            None => Err(RejectReason::UnknownMessage),
        }
    }
}
