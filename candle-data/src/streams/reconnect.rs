//! Reconnection supervision of a single upstream feed.
//!
//! A [`Supervisor`] owns one [`Transport`] and keeps it connected:
//! - every connection is wrapped in a [`TimeoutStream`] so stalled sockets are detected
//! - a connect that does not complete within the stale timeout counts as a failed attempt
//! - after a disconnect it waits `min(max_delay, base_delay * 2^attempt) + jitter`
//! - a connection that stayed up for `stable_after` resets `attempt`
//! - after `max_attempts` consecutive failures the circuit opens and no further connection is
//!   attempted until [`FeedCommand::Reset`] or the optional cooldown

use crate::{
    config::ReconnectConfig,
    error::TransportError,
    instrument::SourceId,
    metrics::EngineMetrics,
    streams::timeout::TimeoutStream,
    transport::{Inbound, Transport},
};
use bytes::Bytes;
use derive_more::Display;
use futures::{Stream, StreamExt};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// Connection status of one feed.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    #[display("connecting")]
    Connecting,
    #[display("connected")]
    Connected,
    #[display("disconnected")]
    Disconnected,
    /// No inbound data within the stale timeout, connection dropped.
    #[display("stale")]
    Stale,
    /// Retries suspended after `max_attempts` consecutive failures.
    #[display("circuit_open")]
    CircuitOpen,
    #[display("closed")]
    Closed,
}

impl FeedStatus {
    /// Determine if data from this feed can currently be trusted to be fresh.
    pub fn is_healthy(&self) -> bool {
        matches!(self, FeedStatus::Connected)
    }
}

/// External command accepted by a running [`Supervisor`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FeedCommand {
    /// Close an open circuit (or cut a pending backoff short) and reconnect immediately.
    Reset,
}

/// Exponential backoff with bounded uniform jitter.
#[derive(Debug)]
pub struct Backoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter_ms: u64,
    attempt: u32,
    rng: StdRng,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Construct a [`Backoff`] with a deterministic jitter sequence.
    pub fn with_seed(config: &ReconnectConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &ReconnectConfig, rng: StdRng) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            max_attempts: config.max_attempts,
            jitter_ms: config.jitter_ms,
            attempt: 0,
            rng,
        }
    }

    /// Consecutive failures recorded since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before retry `attempt`, without jitter: `min(max_delay, base_delay * 2^attempt)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Record a failure, returning the delay before the next attempt, or `None` once
    /// `max_attempts` consecutive failures have been recorded.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let retry = self.attempt;
        self.attempt = self.attempt.saturating_add(1);

        if self.is_exhausted() {
            return None;
        }

        let jitter = if self.jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.rng.random_range(0..=self.jitter_ms))
        };

        Some(self.delay_for(retry) + jitter)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts > 0 && self.attempt >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Why a connection ended.
#[derive(Debug)]
enum Disconnect {
    Stopped,
    IngestClosed,
    Stale,
    Ended,
    Failed(TransportError),
}

/// Keeps one [`Transport`] connected, forwarding raw payloads to the feed's ingest task.
#[derive(Debug)]
pub struct Supervisor<T> {
    source: SourceId,
    transport: T,
    config: ReconnectConfig,
    stale_timeout: Duration,
    payload_tx: mpsc::Sender<Bytes>,
    status_tx: watch::Sender<FeedStatus>,
    command_rx: mpsc::UnboundedReceiver<FeedCommand>,
    stop_rx: watch::Receiver<bool>,
    metrics: Arc<EngineMetrics>,
    backoff: Backoff,
}

/// Channels connecting a [`Supervisor`] to the rest of the engine.
#[derive(Debug)]
pub struct SupervisorChannels {
    pub payload_tx: mpsc::Sender<Bytes>,
    pub status_tx: watch::Sender<FeedStatus>,
    pub command_rx: mpsc::UnboundedReceiver<FeedCommand>,
    /// Set to `true` to close the feed.
    pub stop_rx: watch::Receiver<bool>,
}

impl<T> Supervisor<T>
where
    T: Transport,
{
    pub fn new(
        source: SourceId,
        transport: T,
        config: ReconnectConfig,
        stale_timeout: Duration,
        channels: SupervisorChannels,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let backoff = Backoff::new(&config);
        Self {
            source,
            transport,
            config,
            stale_timeout,
            payload_tx: channels.payload_tx,
            status_tx: channels.status_tx,
            command_rx: channels.command_rx,
            stop_rx: channels.stop_rx,
            metrics,
            backoff,
        }
    }

    /// Replace the jitter source, for deterministic delays.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn set_status(&self, status: FeedStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            debug!(source = %self.source, %previous, %status, "feed status changed");
        }
    }

    /// Run until stopped, or until the ingest side hangs up.
    pub async fn run(mut self) {
        info!(source = %self.source, endpoint = self.transport.endpoint(), "feed supervisor started");

        loop {
            if *self.stop_rx.borrow() {
                break;
            }

            self.set_status(FeedStatus::Connecting);
            self.metrics.connect_attempts.inc();

            let connection = tokio::select! {
                biased;
                _ = stopped(&mut self.stop_rx) => break,
                connection = tokio::time::timeout(self.stale_timeout, self.transport.connect()) => {
                    connection.unwrap_or_else(|_| Err(TransportError::ConnectTimeout(self.stale_timeout)))
                }
            };

            match connection {
                Ok(connection) => {
                    info!(source = %self.source, endpoint = self.transport.endpoint(), "feed connected");
                    self.set_status(FeedStatus::Connected);
                    let connected_at = Instant::now();

                    match self.drive(connection).await {
                        Disconnect::Stopped | Disconnect::IngestClosed => break,
                        Disconnect::Stale => {
                            self.metrics.stale_timeouts.inc();
                            self.set_status(FeedStatus::Stale);
                        }
                        Disconnect::Ended => {
                            warn!(source = %self.source, "feed connection ended");
                            self.set_status(FeedStatus::Disconnected);
                        }
                        Disconnect::Failed(error) => {
                            warn!(source = %self.source, %error, "feed connection failed");
                            self.set_status(FeedStatus::Disconnected);
                        }
                    }

                    self.metrics.disconnects.inc();
                    if connected_at.elapsed() >= self.config.stable_after() {
                        self.backoff.reset();
                    }
                }
                Err(error) => {
                    warn!(source = %self.source, %error, "feed connect failed");
                    self.set_status(FeedStatus::Disconnected);
                }
            }

            match self.backoff.next_delay() {
                Some(delay) => {
                    debug!(
                        source = %self.source,
                        attempt = self.backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "scheduling reconnect"
                    );
                    if !self.wait(Some(delay)).await {
                        break;
                    }
                }
                None => {
                    error!(
                        source = %self.source,
                        attempts = self.backoff.attempt(),
                        "feed circuit open, reconnection suspended"
                    );
                    self.metrics.circuit_opens.inc();
                    self.set_status(FeedStatus::CircuitOpen);
                    if !self.wait(self.config.circuit_cooldown()).await {
                        break;
                    }
                    info!(source = %self.source, "feed circuit closed");
                    self.backoff.reset();
                }
            }
        }

        self.set_status(FeedStatus::Closed);
        info!(source = %self.source, "feed supervisor stopped");
    }

    /// Forward inbound payloads until the connection ends, stalls or the feed is stopped.
    async fn drive<C>(&mut self, connection: C) -> Disconnect
    where
        C: Stream<Item = Result<Inbound, TransportError>>,
    {
        let connection = TimeoutStream::new(connection, self.stale_timeout);
        tokio::pin!(connection);

        loop {
            let inbound = tokio::select! {
                biased;
                _ = stopped(&mut self.stop_rx) => return Disconnect::Stopped,
                Some(command) = self.command_rx.recv() => {
                    debug!(source = %self.source, ?command, "ignoring command while connected");
                    continue;
                }
                inbound = connection.next() => inbound,
            };

            match inbound {
                Some(Ok(Inbound::Payload(payload))) => {
                    if self.payload_tx.send(payload).await.is_err() {
                        return Disconnect::IngestClosed;
                    }
                }
                Some(Ok(Inbound::KeepAlive)) => self.metrics.keep_alives.inc(),
                Some(Err(error)) if error.is_stale() => return Disconnect::Stale,
                Some(Err(error)) => return Disconnect::Failed(error),
                None => return Disconnect::Ended,
            }
        }
    }

    /// Wait for `delay` (forever if `None`), returning early on [`FeedCommand::Reset`].
    ///
    /// Returns `false` if the feed was stopped while waiting.
    async fn wait(&mut self, delay: Option<Duration>) -> bool {
        let sleep = async move {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut self.stop_rx) => return false,
                command = self.command_rx.recv() => match command {
                    Some(FeedCommand::Reset) => {
                        info!(source = %self.source, "feed reset requested");
                        self.backoff.reset();
                        return true;
                    }
                    // Command senders gone, only the delay or a stop can end the wait
                    None => {
                        tokio::select! {
                            biased;
                            _ = stopped(&mut self.stop_rx) => return false,
                            _ = &mut sleep => return true,
                        }
                    }
                },
                _ = &mut sleep => return true,
            }
        }
    }
}

/// Resolves once the stop flag is set, or its sender is dropped.
pub(crate) async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}
