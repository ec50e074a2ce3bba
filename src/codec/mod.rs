//! Payload decoding
//!
//! Raw s16le PCM from the byte-stream transport, and Opus from the WebRTC
//! media track.

pub mod pcm;
#[cfg(feature = "rtc")]
pub mod decoder;

pub use pcm::decode_s16le;
#[cfg(feature = "rtc")]
pub use decoder::OpusDecoder;
