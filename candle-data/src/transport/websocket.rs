use super::{Inbound, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    SinkExt, Stream, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{net::TcpStream, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, Utf8Bytes},
};
use tracing::{debug, info};
use url::Url;

type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Keep-alive frame sent periodically by a [`WebSocketTransport`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum PingFrame {
    /// WebSocket protocol Ping control frame.
    Protocol,
    /// Venue defined application level text ping (eg/ Okx "ping").
    Text(&'static str),
}

impl PingFrame {
    fn message(&self) -> Message {
        match *self {
            PingFrame::Protocol => Message::Ping(Bytes::new()),
            PingFrame::Text(text) => Message::Text(Utf8Bytes::from_static(text)),
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct PingConfig {
    interval: Duration,
    frame: PingFrame,
}

/// [`Transport`] connecting to a WebSocket endpoint.
///
/// On every connect the configured subscription frames are sent before any message is read,
/// and a ping task is spawned that lives as long as the [`WebSocketConnection`].
#[derive(Clone, Debug)]
pub struct WebSocketTransport {
    url: Url,
    subscriptions: Vec<String>,
    ping: Option<PingConfig>,
}

impl WebSocketTransport {
    pub fn new(url: &str) -> Result<Self, TransportError> {
        Ok(Self {
            url: Url::parse(url)?,
            subscriptions: Vec::new(),
            ping: None,
        })
    }

    /// Text frames sent after every (re)connect.
    pub fn with_subscriptions(mut self, subscriptions: Vec<String>) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    /// Send `frame` every `interval`. A zero interval disables pings.
    pub fn with_ping(mut self, interval: Duration, frame: PingFrame) -> Self {
        self.ping = (!interval.is_zero()).then_some(PingConfig { interval, frame });
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    type Connection = WebSocketConnection;

    fn endpoint(&self) -> &str {
        self.url.as_str()
    }

    async fn connect(&self) -> Result<Self::Connection, TransportError> {
        debug!(url = %self.url, "connecting to WebSocket");

        let (websocket, _) =
            connect_async(self.url.as_str())
                .await
                .map_err(|error| TransportError::Connect {
                    endpoint: self.url.to_string(),
                    reason: error.to_string(),
                })?;

        let (mut write, read) = websocket.split();

        for subscription in &self.subscriptions {
            write.send(Message::text(subscription.as_str())).await?;
        }

        info!(
            url = %self.url,
            subscriptions = self.subscriptions.len(),
            "connected to WebSocket"
        );

        let ping_task = self.ping.map(|ping| tokio::spawn(run_ping(write, ping)));

        Ok(WebSocketConnection { read, ping_task })
    }
}

async fn run_ping(mut write: SplitSink<WebSocket, Message>, ping: PingConfig) {
    let mut interval = tokio::time::interval(ping.interval);
    // First tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        if let Err(error) = write.send(ping.frame.message()).await {
            debug!(%error, "failed to send ping, connection likely dead");
            break;
        }
    }
}

/// Live WebSocket connection yielding [`Inbound`] items.
///
/// Closing frames end the stream. Dropping the connection stops its ping task.
#[derive(Debug)]
pub struct WebSocketConnection {
    read: SplitStream<WebSocket>,
    ping_task: Option<JoinHandle<()>>,
}

impl Stream for WebSocketConnection {
    type Item = Result<Inbound, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let message = match self.read.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(message))) => message,
                Poll::Ready(Some(Err(error))) => return Poll::Ready(Some(Err(error.into()))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            };

            match message {
                Message::Text(text) => {
                    let payload = Bytes::copy_from_slice(text.as_bytes());
                    return Poll::Ready(Some(Ok(Inbound::Payload(payload))));
                }
                Message::Binary(payload) => {
                    return Poll::Ready(Some(Ok(Inbound::Payload(payload))));
                }
                Message::Ping(_) | Message::Pong(_) => {
                    return Poll::Ready(Some(Ok(Inbound::KeepAlive)));
                }
                Message::Close(frame) => {
                    debug!(?frame, "WebSocket closed by peer");
                    return Poll::Ready(None);
                }
                Message::Frame(_) => continue,
            }
        }
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        if let Some(ping_task) = self.ping_task.take() {
            ping_task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_transport_new() {
        struct TestCase {
            input: &'static str,
            expected_ok: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: secure url
                input: "wss://stream.bybit.com/v5/public/spot",
                expected_ok: true,
            },
            TestCase {
                // TC1: plain url with port
                input: "ws://127.0.0.1:9001",
                expected_ok: true,
            },
            TestCase {
                // TC2: not a url
                input: "not a url",
                expected_ok: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = WebSocketTransport::new(test.input);
            assert_eq!(actual.is_ok(), test.expected_ok, "TC{} failed", index);
        }
    }

    #[test]
    fn test_ping_frame_message() {
        assert_eq!(PingFrame::Protocol.message(), Message::Ping(Bytes::new()));
        assert_eq!(
            PingFrame::Text("ping").message(),
            Message::Text(Utf8Bytes::from_static("ping"))
        );
    }

    #[test]
    fn test_with_ping_zero_interval_disables() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:9001")
            .unwrap()
            .with_ping(Duration::ZERO, PingFrame::Protocol);
        assert!(transport.ping.is_none());
    }
}
