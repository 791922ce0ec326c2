use crate::instrument::SourceId;
use std::time::Duration;
use thiserror::Error;

/// Errors generated by a [`Transport`](crate::transport::Transport) connection.
///
/// All variants are recovered by the reconnection
/// [`Supervisor`](crate::streams::reconnect::Supervisor).
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),

    #[error("connect did not complete within {0:?}")]
    ConnectTimeout(Duration),

    #[error("no inbound data received for {0:?}")]
    Stale(Duration),

    #[error("transport closed: {0}")]
    Closed(String),
}

impl TransportError {
    /// Determine if this error was raised by the heartbeat timeout rather than the transport.
    pub fn is_stale(&self) -> bool {
        matches!(self, TransportError::Stale(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(error.to_string())
    }
}

/// Invalid [`EngineConfig`](crate::config::EngineConfig).
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ConfigError {
    #[error("intervalsSeconds must contain at least one interval")]
    NoIntervals,

    #[error("intervalsSeconds must be > 0")]
    ZeroInterval,

    #[error("{field} must be > 0")]
    Zero { field: &'static str },

    #[error("reconnect.baseDelayMs {base_delay_ms} exceeds reconnect.maxDelayMs {max_delay_ms}")]
    DelayRange {
        base_delay_ms: u64,
        max_delay_ms: u64,
    },

    #[error("failed to read config: {0}")]
    Io(String),

    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// All errors returned to callers of the [`Engine`](crate::engine::Engine) API.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error("interval {0}s is not configured")]
    UnknownInterval(u32),

    #[error("feed {0} does not exist")]
    UnknownFeed(SourceId),

    #[error("feed {0} already exists")]
    DuplicateFeed(SourceId),

    #[error("venue {0} has no default url, provide one explicitly")]
    MissingUrl(String),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("engine is shut down")]
    ShutDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_is_stale() {
        struct TestCase {
            input: TransportError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: heartbeat timeout
                input: TransportError::Stale(Duration::from_secs(30)),
                expected: true,
            },
            TestCase {
                // TC1: connection failure
                input: TransportError::Connect {
                    endpoint: "wss://localhost".to_string(),
                    reason: "refused".to_string(),
                },
                expected: false,
            },
            TestCase {
                // TC2: socket error
                input: TransportError::WebSocket("Io(Kind(UnexpectedEof))".to_string()),
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.is_stale();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
