#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity)]

//! # Candle-Data
//! Real-time trade ingestion and multi-interval OHLCV candle aggregation.
//!
//! **It is:**
//! * **Resilient**: every feed runs under a [`Supervisor`](streams::reconnect::Supervisor) with
//!   exponential backoff, stale detection and a circuit breaker.
//! * **Normalised**: venue payloads (Binance, Bybit, OKX, canonical JSON) are parsed into one
//!   validated [`Trade`](trade::Trade) model, with sequence based de-duplication.
//! * **Bounded**: every candle series, trade history and subscriber queue has a fixed capacity.
//!
//! ## Overview
//! An [`Engine`](engine::Engine) owns an [`InstrumentStore`](store::InstrumentStore) holding one
//! [`CandleAggregator`](aggregator::CandleAggregator) per instrument, and a
//! [`SubscriptionHub`](hub::SubscriptionHub) which coalesces candle and trade updates to
//! subscribers. Feeds are added with any [`Transport`](transport::Transport) and
//! [`TradeParser`](normalizer::TradeParser).
//!
//! ## Example
//! ```rust,no_run
//! use candle_data::{
//!     config::EngineConfig,
//!     engine::Engine,
//!     exchange::Venue,
//!     instrument::{InstrumentId, SourceId},
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Engine::new(EngineConfig::default()).unwrap();
//!
//!     engine
//!         .add_venue_feed(SourceId::new("bybit-spot"), Venue::Bybit, None, &["BTCUSDT"])
//!         .unwrap();
//!
//!     let mut candles = engine.subscribe(InstrumentId::new("BTCUSDT"), 60).unwrap();
//!     while let Some(update) = candles.recv().await {
//!         println!("{update:?}");
//!     }
//! }
//! ```

/// Per instrument, multi-interval candle series.
pub mod aggregator;

/// OHLCV [`Candle`](candle::Candle) and bucket arithmetic.
pub mod candle;

/// Engine configuration, loadable from JSON.
pub mod config;

/// Serde helpers for venue payloads.
pub mod de;

/// Top level [`Engine`](engine::Engine) wiring feeds, storage and subscriptions together.
pub mod engine;

/// All errors generated in `candle-data`.
pub mod error;

/// Built-in venue parsers and WebSocket subscription frames.
pub mod exchange;

/// Coalescing fan-out of candle, trade and feed status updates.
pub mod hub;

/// Instrument and feed identifiers.
pub mod instrument;

/// Atomic engine counters.
pub mod metrics;

/// Conversion of raw payloads into validated, de-duplicated trades.
pub mod normalizer;

/// Concurrent per instrument state.
pub mod store;

/// Stream utilities: heartbeat timeout and feed supervision.
pub mod streams;

/// Normalised [`Trade`](trade::Trade) model.
pub mod trade;

/// Connection abstraction over WebSocket and in-process channels.
pub mod transport;

pub use engine::Engine;
pub use error::EngineError;

// Only used by examples
#[cfg(test)]
use tracing_subscriber as _;
