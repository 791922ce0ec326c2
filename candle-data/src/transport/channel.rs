use super::{Inbound, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;

type ConnectOutcome = Result<mpsc::Receiver<Inbound>, TransportError>;

/// [`Transport`] whose connections are handed to it by the caller.
///
/// Every call to [`Transport::connect`] takes the next outcome queued on the paired
/// [`ChannelTransportHandle`], waiting until one is available. Useful for callers that own their
/// own I/O, and for driving the engine deterministically.
#[derive(Debug)]
pub struct ChannelTransport {
    endpoint: String,
    outcomes: Mutex<mpsc::UnboundedReceiver<ConnectOutcome>>,
    attempts: Arc<AtomicUsize>,
}

/// Caller side of a [`ChannelTransport`].
#[derive(Debug, Clone)]
pub struct ChannelTransportHandle {
    outcomes: mpsc::UnboundedSender<ConnectOutcome>,
    attempts: Arc<AtomicUsize>,
}

impl ChannelTransport {
    pub fn new(endpoint: impl Into<String>) -> (Self, ChannelTransportHandle) {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));

        (
            Self {
                endpoint: endpoint.into(),
                outcomes: Mutex::new(outcome_rx),
                attempts: Arc::clone(&attempts),
            },
            ChannelTransportHandle {
                outcomes: outcome_tx,
                attempts,
            },
        )
    }
}

impl ChannelTransportHandle {
    /// Queue a successful connection, returning the sender feeding it.
    ///
    /// Dropping every clone of the returned sender ends the connection.
    pub fn open(&self, capacity: usize) -> Option<ChannelConnection> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.outcomes.send(Ok(rx)).ok()?;
        Some(ChannelConnection { tx })
    }

    /// Queue a failed connection attempt.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.outcomes
            .send(Err(TransportError::Closed(reason.into())))
            .is_ok()
    }

    /// Number of times [`Transport::connect`] has been called.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// Sending half of one [`ChannelTransport`] connection.
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    tx: mpsc::Sender<Inbound>,
}

impl ChannelConnection {
    pub async fn send(&self, payload: impl Into<Bytes>) -> bool {
        self.tx.send(Inbound::Payload(payload.into())).await.is_ok()
    }

    pub async fn keep_alive(&self) -> bool {
        self.tx.send(Inbound::KeepAlive).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    type Connection = futures::stream::Map<
        ReceiverStream<Inbound>,
        fn(Inbound) -> Result<Inbound, TransportError>,
    >;

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> Result<Self::Connection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let outcome = self.outcomes.lock().await.recv().await;
        match outcome {
            Some(Ok(rx)) => Ok(ReceiverStream::new(rx)
                .map(Ok as fn(Inbound) -> Result<Inbound, TransportError>)),
            Some(Err(error)) => Err(error),
            None => Err(TransportError::Closed(format!(
                "{} handle dropped",
                self.endpoint
            ))),
        }
    }
}
