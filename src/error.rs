//! Error types for the live PCM stream client

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio output errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Truncated PCM payload: {0} bytes is not a whole number of 16-bit samples")]
    TruncatedSample(usize),
}

/// Adaptive buffer errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    #[error("Write of {samples} samples is not aligned to {channels} channels")]
    Misaligned { samples: usize, channels: u16 },
}

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Payload received before audio configuration")]
    MissingConfig,

    #[error("Invalid stream format: {0}")]
    InvalidFormat(String),

    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Signaling got no answer within {0} ms")]
    SignalingTimeout(u64),

    #[error("No media track arrived within {0} ms")]
    TrackTimeout(u64),

    #[error("Stream connect timed out after {0} ms")]
    ConnectTimeout(u64),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Remote rejected session: {0}")]
    Rejected(String),

    #[error("Connection closed by remote")]
    Closed,

    #[error("Preferred transport unavailable in this build")]
    Unavailable,

    #[error("All transports failed (preferred: {preferred}; fallback: {fallback})")]
    AllTransportsFailed { preferred: String, fallback: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[cfg(feature = "rtc")]
impl From<webrtc::Error> for TransportError {
    fn from(err: webrtc::Error) -> Self {
        TransportError::Negotiation(err.to_string())
    }
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
