use self::trade::{BinanceCombined, BinanceTrade};
use crate::{
    exchange::parse_value,
    normalizer::{Parsed, RawTrade, RejectReason, TradeParser},
};
use serde_json::{Value, json};
use smol_str::{SmolStr, format_smolstr};

/// Public trade types for `Binance`.
pub mod trade;

/// `Binance` spot server base url.
///
/// See docs: <https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams>
pub const BASE_URL_BINANCE_SPOT: &str = "wss://stream.binance.com:9443/ws";

/// `Binance` trade stream event type.
pub const EVENT_TRADE: &str = "trade";

pub(crate) fn subscribe_requests<S>(symbols: &[S]) -> Vec<String>
where
    S: AsRef<str>,
{
    let params = symbols
        .iter()
        .map(|symbol| format!("{}@{EVENT_TRADE}", symbol.as_ref().to_lowercase()))
        .collect::<Vec<_>>();

    vec![json!({ "method": "SUBSCRIBE", "params": params, "id": 1 }).to_string()]
}

/// [`TradeParser`] for the `Binance` `<symbol>@trade` stream.
///
/// Accepts both raw stream payloads and the `{"stream", "data"}` combined stream envelope.
#[derive(Copy, Clone, Debug, Default)]
pub struct BinanceParser;

impl TradeParser for BinanceParser {
    fn parse(&self, payload: &[u8]) -> Result<Parsed, RejectReason> {
        let value = parse_value(payload)?;

        // Response to a SUBSCRIBE request: {"result": null, "id": 1}
        if value.get("result").is_some() && value.get("id").is_some() {
            return Ok(Parsed::KeepAlive);
        }

        let event = if value.get("stream").is_some() {
            serde_json::from_value::<BinanceCombined>(value)?.data
        } else {
            value
        };

        match event.get("e").and_then(Value::as_str) {
            Some(EVENT_TRADE) => {
                let trade = serde_json::from_value::<BinanceTrade>(event)?;
                Ok(Parsed::Trades(vec![RawTrade {
                    instrument: SmolStr::new(&trade.symbol),
                    timestamp_millis: trade.time,
                    price: trade.price,
                    quantity: trade.amount,
                    side: Some(trade.side()),
                    sequence: Some(format_smolstr!("{}", trade.id)),
                }]))
            }
            Some(_) => Ok(Parsed::Ignored),
            None => Err(RejectReason::UnknownMessage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::Side;

    #[test]
    fn test_binance_parser() {
        let expected = Ok(Parsed::Trades(vec![RawTrade {
            instrument: SmolStr::new("BNBBTC"),
            timestamp_millis: 1672515782136,
            price: 0.001,
            quantity: 100.0,
            side: Some(Side::Sell),
            sequence: Some(SmolStr::new("12345")),
        }]));

        struct TestCase {
            input: &'static str,
            expected: Result<Parsed, RejectReason>,
        }

        let tests = vec![
            TestCase {
                // TC0: raw stream trade, buyer is maker so the aggressor sold
                input: r#"{"e":"trade","E":1672515782136,"s":"BNBBTC","t":12345,"p":"0.001","q":"100","T":1672515782136,"m":true,"M":true}"#,
                expected: expected.clone(),
            },
            TestCase {
                // TC1: combined stream envelope
                input: r#"{"stream":"bnbbtc@trade","data":{"e":"trade","E":1672515782136,"s":"BNBBTC","t":12345,"p":"0.001","q":"100","T":1672515782136,"m":true,"M":true}}"#,
                expected,
            },
            TestCase {
                // TC2: subscribe response
                input: r#"{"result":null,"id":1}"#,
                expected: Ok(Parsed::KeepAlive),
            },
            TestCase {
                // TC3: other event type
                input: r#"{"e":"aggTrade","E":1672515782136,"s":"BNBBTC"}"#,
                expected: Ok(Parsed::Ignored),
            },
            TestCase {
                // TC4: no event type
                input: r#"{"s":"BNBBTC"}"#,
                expected: Err(RejectReason::UnknownMessage),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = BinanceParser.parse(test.input.as_bytes());
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
