use self::trade::OkxTrades;
use crate::{
    exchange::parse_value,
    normalizer::{Parsed, RawTrade, RejectReason, TradeParser},
};
use serde_json::{Value, json};
use smol_str::SmolStr;
use tracing::warn;

/// Public trade types for `Okx`.
pub mod trade;

/// `Okx` server base url.
///
/// See docs: <https://www.okx.com/docs-v5/en/#overview-api-resources-and-support>
pub const BASE_URL_OKX: &str = "wss://ws.okx.com:8443/ws/v5/public";

/// `Okx` application level ping, answered with a raw `pong` text frame.
///
/// See docs: <https://www.okx.com/docs-v5/en/#websocket-api-connect>
pub const PING_OKX: &str = "ping";

/// `Okx` real-time trades channel name.
///
/// See docs: <https://www.okx.com/docs-v5/en/#websocket-api-public-channel-trades-channel>
pub const CHANNEL_TRADES: &str = "trades";

pub(crate) fn subscribe_requests<S>(symbols: &[S]) -> Vec<String>
where
    S: AsRef<str>,
{
    let args = symbols
        .iter()
        .map(|symbol| {
            json!({
                "channel": CHANNEL_TRADES,
                "instId": symbol.as_ref()
            })
        })
        .collect::<Vec<_>>();

    vec![json!({ "op": "subscribe", "args": args }).to_string()]
}

/// [`TradeParser`] for the `Okx` v5 `trades` channel.
#[derive(Copy, Clone, Debug, Default)]
pub struct OkxParser;

impl TradeParser for OkxParser {
    fn parse(&self, payload: &[u8]) -> Result<Parsed, RejectReason> {
        // Okx answers the text ping with a bare, non-JSON "pong"
        if payload == b"pong" {
            return Ok(Parsed::KeepAlive);
        }

        let value = parse_value(payload)?;

        if let Some(event) = value.get("event").and_then(Value::as_str) {
            if event == "error" {
                let code = value.get("code").and_then(Value::as_str).unwrap_or_default();
                let msg = value.get("msg").and_then(Value::as_str).unwrap_or_default();
                warn!(%code, %msg, "Okx rejected request");
                return Ok(Parsed::Ignored);
            }
            return Ok(Parsed::KeepAlive);
        }

        let channel = value
            .get("arg")
            .and_then(|arg| arg.get("channel"))
            .and_then(Value::as_str);

        match channel {
            Some(CHANNEL_TRADES) => {
                let trades = serde_json::from_value::<OkxTrades>(value)?;
                Ok(Parsed::Trades(
                    trades
                        .data
                        .into_iter()
                        .map(|trade| RawTrade {
                            instrument: SmolStr::new(&trade.inst_id),
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
