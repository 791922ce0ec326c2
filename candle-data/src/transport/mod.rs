use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

/// In-process [`Transport`] whose connections are supplied by the caller.
pub mod channel;

/// [`Transport`] over a WebSocket, with subscription frames and keep-alive pings.
pub mod websocket;

/// Item yielded by a live transport connection.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Inbound {
    /// Raw payload handed to the trade normaliser.
    Payload(Bytes),
    /// Transport level keep-alive (eg/ WebSocket Ping/Pong). Proves liveness, carries no data.
    KeepAlive,
}

/// Establishes connections to one upstream endpoint.
///
/// A connection is a [`Stream`] of [`Inbound`] items that ends when the upstream closes it.
/// Errors are reported as items and end the connection from the supervisor's point of view.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Stream<Item = Result<Inbound, TransportError>> + Send + Unpin + 'static;

    /// Human readable endpoint used in logs.
    fn endpoint(&self) -> &str;

    async fn connect(&self) -> Result<Self::Connection, TransportError>;
}
