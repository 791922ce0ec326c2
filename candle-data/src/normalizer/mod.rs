use crate::{
    instrument::{InstrumentId, SourceId},
    trade::{Side, Trade},
};
use smol_str::SmolStr;
use thiserror::Error;
use tracing::debug;

/// Bounded recently-seen set used for trade de-duplication.
pub mod dedup;

use dedup::RecentlySeen;

/// Venue agnostic trade extracted from a raw payload, prior to validation.
#[derive(Clone, PartialEq, Debug)]
pub struct RawTrade {
    pub instrument: SmolStr,
    pub timestamp_millis: i64,
    pub price: f64,
    pub quantity: f64,
    pub side: Option<Side>,
    pub sequence: Option<SmolStr>,
}

/// Classification of a single raw payload by a [`TradeParser`].
#[derive(Clone, PartialEq, Debug)]
pub enum Parsed {
    Trades(Vec<RawTrade>),
    /// Venue keep-alive or subscription acknowledgement.
    KeepAlive,
    /// Well formed message that carries no trades (eg/ a different channel).
    Ignored,
}

/// Parses the source specific envelope of a raw payload.
///
/// One implementation exists per venue format, see [`crate::exchange`].
pub trait TradeParser: Send + 'static {
    fn parse(&self, payload: &[u8]) -> Result<Parsed, RejectReason>;
}

impl TradeParser for Box<dyn TradeParser> {
    fn parse(&self, payload: &[u8]) -> Result<Parsed, RejectReason> {
        self.as_ref().parse(payload)
    }
}

/// Why a payload or a trade was rejected at the normalisation boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    #[error("unrecognised message")]
    UnknownMessage,

    #[error("invalid or missing field: {0}")]
    InvalidField(String),

    #[error("invalid number in {field}: {value}")]
    InvalidNumber { field: &'static str, value: f64 },

    #[error("non-positive price: {0}")]
    NonPositivePrice(f64),

    #[error("negative quantity: {0}")]
    NegativeQuantity(f64),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    #[error("empty instrument identifier")]
    EmptyInstrument,
}

impl RejectReason {
    /// Stable reason code used in logs and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::InvalidUtf8 => "invalid_utf8",
            RejectReason::MalformedJson(_) => "malformed_json",
            RejectReason::UnknownMessage => "unknown_message",
            RejectReason::InvalidField(_) => "invalid_field",
            RejectReason::InvalidNumber { .. } => "invalid_number",
            RejectReason::NonPositivePrice(_) => "non_positive_price",
            RejectReason::NegativeQuantity(_) => "negative_quantity",
            RejectReason::InvalidTimestamp(_) => "invalid_timestamp",
            RejectReason::EmptyInstrument => "empty_instrument",
        }
    }
}

impl From<serde_json::Error> for RejectReason {
    fn from(error: serde_json::Error) -> Self {
        if error.is_data() {
            Self::InvalidField(error.to_string())
        } else {
            Self::MalformedJson(error.to_string())
        }
    }
}

/// Validate a [`RawTrade`] into a canonical [`Trade`].
pub fn validate(raw: RawTrade, source: &SourceId) -> Result<Trade, RejectReason> {
    if !raw.price.is_finite() {
        return Err(RejectReason::InvalidNumber {
            field: "price",
            value: raw.price,
        });
    }
    if !raw.quantity.is_finite() {
        return Err(RejectReason::InvalidNumber {
            field: "quantity",
            value: raw.quantity,
        });
    }
    if raw.price <= 0.0 {
        return Err(RejectReason::NonPositivePrice(raw.price));
    }
    if raw.quantity < 0.0 {
        return Err(RejectReason::NegativeQuantity(raw.quantity));
    }
    if raw.timestamp_millis < 0 {
        return Err(RejectReason::InvalidTimestamp(raw.timestamp_millis));
    }

    let instrument = InstrumentId::new(&raw.instrument);
    if instrument.is_empty() {
        return Err(RejectReason::EmptyInstrument);
    }

    Ok(Trade {
        instrument,
        timestamp_millis: raw.timestamp_millis,
        price: raw.price,
        quantity: raw.quantity,
        side: raw.side,
        source: source.clone(),
        sequence: raw.sequence.filter(|sequence| !sequence.is_empty()),
    })
}

/// Everything produced by normalising one raw payload.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Normalized {
    pub trades: Vec<Trade>,
    pub rejected: Vec<RejectReason>,
    pub duplicates: usize,
    pub keep_alive: bool,
}

/// Parses, validates and de-duplicates the raw payloads of one source.
///
/// The recently-seen set survives reconnects, so trades redelivered by an at-least-once feed
/// after a reconnect are dropped.
pub struct TradeNormalizer {
    source: SourceId,
    parser: Box<dyn TradeParser>,
    seen: RecentlySeen<(SourceId, SmolStr)>,
}

impl std::fmt::Debug for TradeNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeNormalizer")
            .field("source", &self.source)
            .field("seen", &self.seen.len())
            .finish()
    }
}

impl TradeNormalizer {
    pub fn new<Parser>(source: SourceId, parser: Parser, dedup_capacity: usize) -> Self
    where
        Parser: TradeParser,
    {
        Self {
            source,
            parser: Box::new(parser),
            seen: RecentlySeen::new(dedup_capacity),
        }
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn normalize(&mut self, payload: &[u8]) -> Normalized {
        let mut normalized = Normalized::default();

        let raw_trades = match self.parser.parse(payload) {
            Ok(Parsed::Trades(raw_trades)) => raw_trades,
            Ok(Parsed::KeepAlive) => {
                normalized.keep_alive = true;
                return normalized;
            }
            Ok(Parsed::Ignored) => return normalized,
            Err(reason) => {
                debug!(
                    source = %self.source,
                    code = reason.code(),
                    %reason,
                    payload = %String::from_utf8_lossy(&payload[..payload.len().min(256)]),
                    "rejected malformed payload"
                );
                normalized.rejected.push(reason);
                return normalized;
            }
        };

        normalized.trades.reserve(raw_trades.len());
        for raw in raw_trades {
            let trade = match validate(raw, &self.source) {
                Ok(trade) => trade,
                Err(reason) => {
                    debug!(source = %self.source, code = reason.code(), %reason, "rejected trade");
                    normalized.rejected.push(reason);
                    continue;
                }
            };

            if let Some(sequence) = &trade.sequence {
                if !self.seen.insert((self.source.clone(), sequence.clone())) {
                    normalized.duplicates += 1;
                    continue;
                }
            }

            normalized.trades.push(trade);
        }

        normalized
    }
}
