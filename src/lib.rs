//! # Live PCM Stream
//!
//! Receive-side client for live audio: negotiates a transport with a producer,
//! absorbs network jitter in an adaptive buffer, and feeds the platform audio
//! callback without ever blocking it.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── PRODUCER (upstream) ─────────────────────────────┐
//! │   /ws/rtc  (WebRTC signaling)              /ws/audio  (JSON config + s16le)  │
//! └───────────────┬──────────────────────────────────────────┬──────────────────┘
//!                 │ preferred                                │ fallback
//!                 ▼                                          ▼
//! ┌──────────────────────────────────────────────────────────────────────────────┐
//! │                  TransportManager (network::manager)                          │
//! │   Idle ─start─► Connecting(Rtc) ─fail─► Connecting(Fallback) ─► Connected     │
//! │   every wait bounded by a timeout, teardown idempotent                        │
//! └───────────────────────────────┬──────────────────────────────────────────────┘
//!                                 │ IngestMessage (config / pcm / samples / reset)
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────────────────┐
//! │  IngestChannel (ingest)  decode s16le ─► BufferWriter                          │
//! └───────────────────────────────┬──────────────────────────────────────────────┘
//!                                 │ lock-free SPSC ring (audio::ring)
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────────────────┐
//! │  RenderCallback (audio thread)  BufferReader: gate, underrun fade, decay      │
//! └───────────────┬──────────────────────────────────────────────────────────────┘
//!                 │ StatusReport (bounded, try_send)
//!                 ▼
//! ┌──────────────────────────────────────────────────────────────────────────────┐
//! │  BackpressureReporter (report)  ─► {"type":"buffer_status", ...} upstream     │
//! └──────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`session::StreamClient`] ties the pieces together behind `start` / `stop`.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod ingest;
pub mod network;
pub mod protocol;
pub mod report;
pub mod session;
pub mod upstream;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Target latency before any underrun has been observed
    pub const DEFAULT_TARGET_MS: f32 = 120.0;

    /// Default producer HTTP port
    pub const DEFAULT_HTTP_PORT: u16 = 8000;

    /// Bounds for the render-side status snapshot interval
    pub const MIN_STATUS_INTERVAL_MS: u64 = 250;
    pub const MAX_STATUS_INTERVAL_MS: u64 = 2000;

    /// Depth of the transport -> ingest queue, in messages
    pub const INGEST_QUEUE_DEPTH: usize = 256;

    /// Depth of the render -> control status queue
    pub const STATUS_QUEUE_DEPTH: usize = 16;

    /// Depth of the outbound control message queue
    pub const OUTBOUND_QUEUE_DEPTH: usize = 32;

    /// Transitions kept in the transport history
    pub const TRANSPORT_HISTORY_LEN: usize = 64;

    /// Sine tone produced by the reference upstream
    pub const REFERENCE_TONE_HZ: f32 = 440.0;
}
