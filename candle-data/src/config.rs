use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Default candle granularities: 1m, 5m, 15m and 1h.
pub const DEFAULT_INTERVALS_SECONDS: [u32; 4] = [60, 300, 900, 3600];

/// Configuration of the [`Engine`](crate::engine::Engine).
///
/// Deserialised from camelCase JSON, every field is optional and falls back to its default:
/// ```json
/// {
///     "intervalsSeconds": [60, 300],
///     "maxCandlesPerSeries": 500,
///     "maxRecentTrades": 200,
///     "reconnect": { "baseDelayMs": 500, "maxDelayMs": 30000, "maxAttempts": 10 },
///     "staleTimeoutMs": 30000,
///     "coalesceWindowMs": 100
/// }
/// ```
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Candle granularities maintained for every instrument.
    pub intervals_seconds: Vec<u32>,
    pub max_candles_per_series: usize,
    pub max_recent_trades: usize,
    pub reconnect: ReconnectConfig,
    /// A connection without any inbound message for this long is considered stale. Also bounds
    /// each connect attempt.
    pub stale_timeout_ms: u64,
    /// Window over which candle updates are merged. 0 delivers every update immediately.
    pub coalesce_window_ms: u64,
    /// Capacity of each feed's recently-seen `(source, sequence)` set.
    pub dedup_capacity: usize,
    /// Capacity of each subscriber's notification queue.
    pub observer_buffer_size: usize,
    /// Capacity of each feed's raw payload queue between I/O and aggregation.
    pub ingest_buffer_size: usize,
    /// Evict instruments without a trade for this long. Absent disables eviction.
    pub instrument_idle_timeout_ms: Option<u64>,
    /// Interval of transport keep-alive pings. 0 disables pings.
    pub ping_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            intervals_seconds: DEFAULT_INTERVALS_SECONDS.to_vec(),
            max_candles_per_series: 500,
            max_recent_trades: 200,
            reconnect: ReconnectConfig::default(),
            stale_timeout_ms: 30_000,
            coalesce_window_ms: 100,
            dedup_capacity: 10_000,
            observer_buffer_size: 1024,
            ingest_buffer_size: 4096,
            instrument_idle_timeout_ms: None,
            ping_interval_ms: 20_000,
        }
    }
}

impl EngineConfig {
    /// Load and validate a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|error| ConfigError::Io(format!("{}: {error}", path.as_ref().display())))?;
        Self::from_json(&contents)
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config = serde_json::from_str::<Self>(json)
            .map_err(|error| ConfigError::Parse(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_intervals(mut self, intervals_seconds: impl Into<Vec<u32>>) -> Self {
        self.intervals_seconds = intervals_seconds.into();
        self
    }

    pub fn with_max_candles_per_series(mut self, max_candles: usize) -> Self {
        self.max_candles_per_series = max_candles;
        self
    }

    pub fn with_max_recent_trades(mut self, max_recent_trades: usize) -> Self {
        self.max_recent_trades = max_recent_trades;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout_ms = duration_millis(timeout);
        self
    }

    pub fn with_coalesce_window(mut self, window: Duration) -> Self {
        self.coalesce_window_ms = duration_millis(window);
        self
    }

    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    pub fn with_observer_buffer_size(mut self, size: usize) -> Self {
        self.observer_buffer_size = size;
        self
    }

    pub fn with_ingest_buffer_size(mut self, size: usize) -> Self {
        self.ingest_buffer_size = size;
        self
    }

    pub fn with_instrument_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.instrument_idle_timeout_ms = timeout.map(duration_millis);
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval_ms = duration_millis(interval);
        self
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn instrument_idle_timeout(&self) -> Option<Duration> {
        self.instrument_idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Intervals deduplicated in ascending order.
    pub fn intervals(&self) -> Vec<u32> {
        let mut intervals = self.intervals_seconds.clone();
        intervals.sort_unstable();
        intervals.dedup();
        intervals
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.intervals_seconds.is_empty() {
            return Err(ConfigError::NoIntervals);
        }
        if self.intervals_seconds.contains(&0) {
            return Err(ConfigError::ZeroInterval);
        }

        let positive = [
            ("maxCandlesPerSeries", self.max_candles_per_series as u64),
            ("maxRecentTrades", self.max_recent_trades as u64),
            ("staleTimeoutMs", self.stale_timeout_ms),
            ("dedupCapacity", self.dedup_capacity as u64),
            ("observerBufferSize", self.observer_buffer_size as u64),
            ("ingestBufferSize", self.ingest_buffer_size as u64),
            (
                "instrumentIdleTimeoutMs",
                self.instrument_idle_timeout_ms.unwrap_or(1),
            ),
        ];
        if let Some((field, _)) = positive.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field });
        }

        self.reconnect.validate()
    }
}

/// Reconnection policy of every feed [`Supervisor`](crate::streams::reconnect::Supervisor).
///
/// The delay before retry `n` (0 based) is `min(maxDelayMs, baseDelayMs * 2^n)` plus a uniform
/// random jitter in `[0, jitterMs]`.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failures before the circuit opens. 0 retries forever.
    pub max_attempts: u32,
    pub jitter_ms: u64,
    /// A connection that stayed up this long resets the attempt counter.
    pub stable_after_ms: u64,
    /// Close an open circuit automatically after this long. Absent waits for an explicit reset.
    pub circuit_cooldown_ms: Option<u64>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 10,
            jitter_ms: 250,
            stable_after_ms: 5_000,
            circuit_cooldown_ms: None,
        }
    }
}

impl ReconnectConfig {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay_ms: duration_millis(base_delay),
            max_delay_ms: duration_millis(max_delay),
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter_ms = duration_millis(jitter);
        self
    }

    pub fn with_stable_after(mut self, stable_after: Duration) -> Self {
        self.stable_after_ms = duration_millis(stable_after);
        self
    }

    pub fn with_circuit_cooldown(mut self, cooldown: Option<Duration>) -> Self {
        self.circuit_cooldown_ms = cooldown.map(duration_millis);
        self
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }

    pub fn circuit_cooldown(&self) -> Option<Duration> {
        self.circuit_cooldown_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delay_ms == 0 {
            return Err(ConfigError::Zero {
                field: "reconnect.maxDelayMs",
            });
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::DelayRange {
                base_delay_ms: self.base_delay_ms,
                max_delay_ms: self.max_delay_ms,
            });
        }
        Ok(())
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
