use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Canonical identifier of a tradable instrument (eg/ "BTCUSDT").
///
/// Venue specific symbols are canonicalised so that the same pair reported by several feeds
/// maps onto one instrument:
/// - upper-cased
/// - separators (`-`, `/`, `_`, `:`) removed
///
/// eg/ OKX "btc-usdt" and Bybit "BTCUSDT" both become "BTCUSDT".
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
pub struct InstrumentId(SmolStr);

impl InstrumentId {
    /// Construct a canonical [`InstrumentId`] from a raw venue symbol.
    pub fn new(raw: &str) -> Self {
        let canonical = raw
            .chars()
            .filter(|c| !matches!(c, '-' | '/' | '_' | ':') && !c.is_whitespace())
            .collect::<String>();

        Self(SmolStr::new(canonical.to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for InstrumentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl AsRef<str> for InstrumentId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Identifier of one upstream trade feed (eg/ "bybit-spot").
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
pub struct SourceId(SmolStr);

impl SourceId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(SmolStr::new(id))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
