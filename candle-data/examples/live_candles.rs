use candle_data::{
    Engine,
    config::EngineConfig,
    exchange::Venue,
    hub::Update,
    instrument::{InstrumentId, SourceId},
};
use futures::StreamExt;
use std::time::Duration;
use tracing::warn;

#[rustfmt::skip]
#[tokio::main]
async fn main() {
    // Initialise INFO Tracing log subscriber
    init_logging();

    let config = EngineConfig::default()
        .with_intervals(vec![60, 300])
        .with_coalesce_window(Duration::from_millis(250));

    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(error) => {
            eprintln!("Failed to initialise engine: {error}");
            return;
        }
    };

    // Same instrument from three venues aggregates into one candle series
    let feeds = [
        (SourceId::new("binance-spot"), Venue::Binance, vec!["BTCUSDT"]),
        (SourceId::new("bybit-spot"), Venue::Bybit, vec!["BTCUSDT"]),
        (SourceId::new("okx-spot"), Venue::Okx, vec!["BTC-USDT"]),
    ];
    for (source, venue, symbols) in feeds {
        if let Err(error) = engine.add_venue_feed(source, venue, None, &symbols) {
            eprintln!("Failed to add {venue} feed: {error}");
            return;
        }
    }

    let btc = InstrumentId::new("BTCUSDT");
    let mut candles = match engine.subscribe(btc.clone(), 60) {
        Ok(subscription) => subscription,
        Err(error) => {
            eprintln!("Failed to subscribe: {error}");
            return;
        }
    };

    println!("Streaming 1m BTCUSDT candles, ctrl-c to stop\n");

    loop {
        tokio::select! {
            update = candles.next() => match update {
                Some(Update::Candle(update)) => {
                    let candle = update.candle;
                    println!(
                        "{:<8} {:>14} O {:>10.2} H {:>10.2} L {:>10.2} C {:>10.2} V {:>12.6} ({} trades)",
                        format!("{:?}", update.change),
                        candle.bucket_start_millis,
                        candle.open,
                        candle.high,
                        candle.low,
                        candle.close,
                        candle.volume,
                        candle.trade_count,
                    );
                }
                Some(Update::Trade(_)) => {}
                Some(Update::Status { source, status }) => {
                    if !status.is_healthy() {
                        warn!(%source, %status, "feed unhealthy");
                    }
                    println!("[{source}] {status}");
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.shutdown().await;

    println!("\n{:#?}", engine.metrics());
    if let Ok(history) = engine.snapshot(&btc, 300, 12) {
        println!("Last {} 5m candles captured", history.len());
    }
}

// Initialise an INFO `Subscriber` for `Tracing` Json logs and install it as the global default.
fn init_logging() {
    tracing_subscriber::fmt()
        // Filter messages based on the INFO
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        // Disable colours on release builds
        .with_ansi(cfg!(debug_assertions))
        // Enable Json formatting
        .json()
        // Install this Tracing subscriber as global default
        .init()
}
