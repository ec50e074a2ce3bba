//! Stream Receiver Application
//!
//! Connects to a producer, buffers the live stream adaptively and plays it on
//! the local output device until Ctrl-C.
//!
//! Usage: `receiver [HOST:PORT]`. Without an address the configured URLs are
//! used (`config.toml` in the platform config directory, or defaults).

use anyhow::Result;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_pcm_stream::{
    audio::{device::list_output_devices, AudioPlayback},
    config::{AppConfig, TransportConfig},
    network::TransportState,
    session::StreamClient,
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

    tracing::info!("Starting stream receiver");

    let mut config = AppConfig::load_or_default()?;
    if let Some(host) = std::env::args().nth(1) {
        config.transport = TransportConfig {
            policy: config.transport.policy,
            ice_servers: config.transport.ice_servers.clone(),
            ..TransportConfig::for_host(&host)
        };
        config.validate()?;
    }

    println!("\n=== Available Output Devices ===");
    for device in list_output_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    tracing::info!(
        signaling = %config.transport.signaling_url,
        stream = %config.transport.stream_url,
        policy = ?config.transport.policy,
        "Connecting"
    );

    let sink_factory = AudioPlayback::factory(config.output.device_id.clone());
    let mut client = StreamClient::new(config, sink_factory);
    let mut state = client.state();

    client.start().await?;
    tracing::info!(kind = ?client.active_kind(), session = ?client.session_id(), "Streaming");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                tracing::info!(state = ?current, "Transport state changed");
                if current == TransportState::Idle {
                    tracing::warn!("Transport lost, reconnecting");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    if let Err(e) = client.start().await {
                        tracing::error!(error = %e, "Reconnect failed");
                        break;
                    }
                }
            }
        }
    }

    client.stop().await;
    Ok(())
}
