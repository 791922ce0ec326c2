use candle_data::{
    config::EngineConfig,
    error::ConfigError,
    exchange::Venue,
    instrument::SourceId,
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::Path};

/// Server configuration: the engine settings plus the feeds to ingest.
///
/// eg/
/// ```json
/// {
///   "listenAddr": "0.0.0.0:9001",
///   "intervalsSeconds": [60, 300],
///   "feeds": [{ "source": "bybit-spot", "venue": "bybit", "symbols": ["BTCUSDT"] }]
/// }
/// ```
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_feeds")]
    pub feeds: Vec<FeedConfig>,
    #[serde(flatten)]
    pub engine: EngineConfig,
}

#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedConfig {
    pub source: SourceId,
    pub venue: Venue,
    #[serde(default)]
    pub url: Option<String>,
    pub symbols: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            feeds: default_feeds(),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|error| ConfigError::Io(error.to_string()))?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config = serde_json::from_str::<Self>(json)
            .map_err(|error| ConfigError::Parse(error.to_string()))?;
        config.engine.validate()?;
        Ok(config)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9001))
}

fn default_feeds() -> Vec<FeedConfig> {
    vec![FeedConfig {
        source: SourceId::new("bybit-spot"),
        venue: Venue::Bybit,
        url: None,
        symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
    }]
}
