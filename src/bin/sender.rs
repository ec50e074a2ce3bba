//! Reference Producer Application
//!
//! Serves the producer side of the stream contract: a sine tone as s16le PCM
//! on `/ws/audio`, paced in real time and throttled by client reports.
//!
//! Usage: `sender [BIND_ADDR]` (default `0.0.0.0:8000`).

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_pcm_stream::{
    constants::DEFAULT_HTTP_PORT,
    upstream::{self, UpstreamConfig},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("0.0.0.0:{}", DEFAULT_HTTP_PORT));

    let config = UpstreamConfig::default();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        sample_rate = config.format.sample_rate,
        channels = config.format.channels,
        tone_hz = config.tone_hz,
        "Reference producer listening"
    );

    tokio::select! {
        result = upstream::serve(listener, config) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }
    Ok(())
}
