//! Reference producer
//!
//! Implements the producer side of the wire contract so the client can be run
//! and tested without the real capture server:
//! - `/ws/audio` sends `audio_config`, then s16le sine chunks at real-time
//!   pace, pausing while the client reports more buffered audio than it needs
//! - `/ws/rtc` rejects WebRTC with a signaling `error`
//! - `/api/status` reports the stream format and listener count

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::codec::pcm::encode_s16le;
use crate::constants::REFERENCE_TONE_HZ;
use crate::protocol::{SignalingMessage, StatusMessage, StreamFormat, UpstreamMessage};

/// Producer settings
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub format: StreamFormat,
    pub tone_hz: f32,
    pub amplitude: f32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            format: StreamFormat {
                sample_rate: 44100,
                channels: 2,
                chunk_frames: Some(1024),
            },
            tone_hz: REFERENCE_TONE_HZ,
            amplitude: 0.25,
        }
    }
}

/// Low/high water pacing driven by client `buffer_status` reports
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throttle {
    low_ms: f64,
    high_ms: f64,
    paused: bool,
}

impl Default for Throttle {
    fn default() -> Self {
        Self {
            low_ms: 80.0,
            high_ms: 160.0,
            paused: false,
        }
    }
}

impl Throttle {
    /// Apply one report; returns whether sending is paused
    pub fn observe(&mut self, buffer_ms: f64, target_ms: Option<f64>) -> bool {
        if let Some(target) = target_ms.filter(|&t| t > 0.0) {
            self.low_ms = (target - 15.0).max(40.0);
            self.high_ms = (self.low_ms + 40.0).max(target + 50.0);
        }
        if buffer_ms > self.high_ms {
            self.paused = true;
        } else if buffer_ms < self.low_ms {
            self.paused = false;
        }
        self.paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn watermarks(&self) -> (f64, f64) {
        (self.low_ms, self.high_ms)
    }
}

/// Phase-continuous sine source
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    step: f32,
    phase: f32,
    amplitude: f32,
    channels: u16,
}

impl ToneGenerator {
    pub fn new(tone_hz: f32, amplitude: f32, format: &StreamFormat) -> Self {
        Self {
            step: std::f32::consts::TAU * tone_hz / format.sample_rate as f32,
            phase: 0.0,
            amplitude,
            channels: format.channels,
        }
    }

    /// Fill `out` with `frames` interleaved frames
    pub fn fill(&mut self, frames: usize, out: &mut Vec<f32>) {
        out.clear();
        for _ in 0..frames {
            let sample = self.phase.sin() * self.amplitude;
            for _ in 0..self.channels {
                out.push(sample);
            }
            self.phase = (self.phase + self.step) % std::f32::consts::TAU;
        }
    }
}

struct UpstreamState {
    config: UpstreamConfig,
    listeners: AtomicUsize,
    chunks_sent: AtomicU64,
}

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// Producer status
#[derive(Serialize)]
pub struct ProducerStatus {
    pub format: StreamFormat,
    pub listeners: usize,
    pub chunks_sent: u64,
}

pub fn router(config: UpstreamConfig) -> Router {
    let state = Arc::new(UpstreamState {
        config,
        listeners: AtomicUsize::new(0),
        chunks_sent: AtomicU64::new(0),
    });
    Router::new()
        .route("/ws/audio", get(audio_ws))
        .route("/ws/rtc", get(rtc_ws))
        .route("/api/status", get(get_status))
        .with_state(state)
}

/// Serve the producer on an already-bound listener
pub async fn serve(listener: TcpListener, config: UpstreamConfig) -> std::io::Result<()> {
    axum::serve(listener, router(config)).await
}

async fn get_status(State(state): State<Arc<UpstreamState>>) -> Json<ApiResponse<ProducerStatus>> {
    Json(ApiResponse {
        success: true,
        data: Some(ProducerStatus {
            format: state.config.format,
            listeners: state.listeners.load(Ordering::Relaxed),
            chunks_sent: state.chunks_sent.load(Ordering::Relaxed),
        }),
    })
}

async fn rtc_ws(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket| async move {
        let reject = SignalingMessage::Error {
            reason: "WebRTC disabled on server".to_string(),
        };
        if let Ok(text) = serde_json::to_string(&reject) {
            let _ = socket.send(Message::Text(text)).await;
        }
        let _ = socket.send(Message::Close(None)).await;
    })
}

async fn audio_ws(ws: WebSocketUpgrade, State(state): State<Arc<UpstreamState>>) -> Response {
    ws.on_upgrade(move |socket| async move {
        state.listeners.fetch_add(1, Ordering::Relaxed);
        stream_tone(socket, &state).await;
        state.listeners.fetch_sub(1, Ordering::Relaxed);
    })
}

async fn stream_tone(socket: WebSocket, state: &UpstreamState) {
    let config = &state.config;
    let format = config.format;
    let (mut sink, mut stream) = socket.split();

    let announce = match serde_json::to_string(&UpstreamMessage::audio_config(&format)) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode audio_config");
            return;
        }
    };
    if sink.send(Message::Text(announce)).await.is_err() {
        return;
    }

    let chunk_frames = format.chunk_frames.unwrap_or(1024) as usize;
    let period = Duration::from_secs_f64(chunk_frames as f64 / format.sample_rate as f64);
    let mut ticker = tokio::time::interval(period);
    let mut tone = ToneGenerator::new(config.tone_hz, config.amplitude, &format);
    let mut throttle = Throttle::default();
    let mut samples = Vec::with_capacity(chunk_frames * format.channels as usize);
    let mut skipped = 0u64;

    tracing::info!(sample_rate = format.sample_rate, channels = format.channels, "Listener connected");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if throttle.is_paused() {
                    skipped += 1;
                    continue;
                }
                tone.fill(chunk_frames, &mut samples);
                let mut pcm = Vec::new();
                encode_s16le(&samples, &mut pcm);
                if sink.send(Message::Binary(pcm)).await.is_err() {
                    break;
                }
                state.chunks_sent.fetch_add(1, Ordering::Relaxed);
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<StatusMessage>(&text) {
                        Ok(StatusMessage::BufferStatus { buffer_ms, target_ms, underruns }) => {
                            let paused = throttle.observe(buffer_ms, target_ms);
                            tracing::debug!(buffer_ms, ?target_ms, underruns, paused, "Client status");
                        }
                        Err(e) => tracing::debug!(error = %e, "Ignoring client message"),
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }
    tracing::info!(skipped, "Listener disconnected");
}
