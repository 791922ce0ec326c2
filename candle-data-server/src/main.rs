mod config;

use crate::config::ServerConfig;
use candle_data::{
    Engine, EngineError,
    candle::Candle,
    error::ConfigError,
    hub::{Subscription, SubscriptionId, Update},
    instrument::{InstrumentId, SourceId},
    metrics::MetricsSnapshot,
    streams::reconnect::FeedStatus,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tokio_stream::StreamMap;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const DEFAULT_SNAPSHOT_CANDLES: usize = 100;

#[derive(Debug, Error)]
enum ServerError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("engine: {0}")]
    Engine(#[from] EngineError),

    #[error("invalid WS_ADDR {0}")]
    Addr(String),

    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },
}

/// Request sent by a WebSocket client.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientRequest {
    Subscribe {
        instrument: String,
        interval: u32,
        #[serde(default = "default_snapshot_candles")]
        snapshot: usize,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
    },
    Status,
}

fn default_snapshot_candles() -> usize {
    DEFAULT_SNAPSHOT_CANDLES
}

/// Message sent to a WebSocket client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Welcome {
        intervals: Vec<u32>,
        feeds: Vec<(SourceId, FeedStatus)>,
    },
    Snapshot {
        subscription_id: SubscriptionId,
        instrument: InstrumentId,
        interval: u32,
        latest_price: Option<f64>,
        candles: Vec<Candle>,
    },
    Update {
        subscription_id: SubscriptionId,
        update: Update,
    },
    Unsubscribed {
        subscription_id: SubscriptionId,
    },
    Status {
        feeds: Vec<(SourceId, FeedStatus)>,
        metrics: MetricsSnapshot,
    },
    Error {
        message: String,
    },
}

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(error) = run().await {
        error!(%error, "candle-data-server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ServerError> {
    // Configurable via CANDLE_CONFIG env var (default: built-in config)
    let mut config = match std::env::var("CANDLE_CONFIG") {
        Ok(path) => {
            info!(%path, "loading config");
            ServerConfig::from_path(path)?
        }
        Err(_) => ServerConfig::default(),
    };

    // Configurable via WS_ADDR env var
    if let Ok(addr) = std::env::var("WS_ADDR") {
        config.listen_addr = addr.parse().map_err(|_| ServerError::Addr(addr))?;
    }

    let engine = Arc::new(Engine::new(config.engine.clone())?);
    for feed in &config.feeds {
        engine.add_venue_feed(
            feed.source.clone(),
            feed.venue,
            feed.url.as_deref(),
            &feed.symbols,
        )?;
        info!(source = %feed.source, venue = %feed.venue, symbols = ?feed.symbols, "feed started");
    }

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|error| ServerError::Bind {
            addr: config.listen_addr,
            reason: error.to_string(),
        })?;
    info!("WebSocket server listening on ws://{}", config.listen_addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    info!("New WebSocket connection from {}", peer_addr);
                    tokio::spawn(handle_client(
                        stream,
                        peer_addr,
                        Arc::clone(&engine),
                        shutdown_rx.clone(),
                    ));
                }
                Err(error) => warn!(%error, "failed to accept connection"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, shutting down");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    engine.shutdown().await;
    Ok(())
}

/// Serve one WebSocket client until it disconnects or the server shuts down.
async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    engine: Arc<Engine>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut subscriptions = StreamMap::<SubscriptionId, Subscription>::new();

    let welcome = ServerMessage::Welcome {
        intervals: engine.intervals().to_vec(),
        feeds: engine.feeds(),
    };
    if send(&mut ws_sender, &welcome).await.is_err() {
        return;
    }

    loop {
        let reply = tokio::select! {
            message = ws_receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    handle_request(&engine, &mut subscriptions, text.as_str())
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    error!("WebSocket error for {}: {}", peer_addr, e);
                    break;
                }
            },
            Some((subscription_id, update)) = subscriptions.next(), if !subscriptions.is_empty() => {
                ServerMessage::Update { subscription_id, update }
            }
            _ = shutdown_rx.changed() => break,
        };

        if send(&mut ws_sender, &reply).await.is_err() {
            break;
        }
    }

    for subscription_id in subscriptions.keys() {
        engine.unsubscribe(*subscription_id);
    }
    info!("WebSocket connection closed for {}", peer_addr);
}

fn handle_request(
    engine: &Engine,
    subscriptions: &mut StreamMap<SubscriptionId, Subscription>,
    text: &str,
) -> ServerMessage {
    let request = match serde_json::from_str::<ClientRequest>(text) {
        Ok(request) => request,
        Err(error) => {
            debug!(%error, %text, "invalid client request");
            return ServerMessage::Error {
                message: format!("invalid request: {error}"),
            };
        }
    };

    match request {
        ClientRequest::Subscribe {
            instrument,
            interval,
            snapshot,
        } => {
            let instrument = InstrumentId::new(&instrument);

            // Register before reading the snapshot so no update falls between the two
            let subscription = match engine.subscribe(instrument.clone(), interval) {
                Ok(subscription) => subscription,
                Err(error) => {
                    return ServerMessage::Error {
                        message: error.to_string(),
                    };
                }
            };
            let candles = match engine.snapshot(&instrument, interval, snapshot) {
                Ok(candles) => candles,
                Err(error) => {
                    engine.unsubscribe(subscription.id);
                    return ServerMessage::Error {
                        message: error.to_string(),
                    };
                }
            };

            let subscription_id = subscription.id;
            subscriptions.insert(subscription_id, subscription);

            ServerMessage::Snapshot {
                subscription_id,
                latest_price: engine.latest_price(&instrument),
                instrument,
                interval,
                candles,
            }
        }
        ClientRequest::Unsubscribe { subscription_id } => {
            if subscriptions.remove(&subscription_id).is_some() {
                engine.unsubscribe(subscription_id);
                ServerMessage::Unsubscribed { subscription_id }
            } else {
                ServerMessage::Error {
                    message: format!("unknown subscription {subscription_id}"),
                }
            }
        }
        ClientRequest::Status => ServerMessage::Status {
            feeds: engine.feeds(),
            metrics: engine.metrics(),
        },
    }
}

async fn send<S>(sender: &mut S, message: &ServerMessage) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(error) => {
            warn!(%error, "failed to serialise server message");
            return Ok(());
        }
    };

    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
