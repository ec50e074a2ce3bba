//! Wire and in-process message types
//!
//! Every channel carries a closed set of variants:
//! - upstream control (`UpstreamMessage`): what the producer sends as text
//! - ingest (`IngestMessage`): what transports hand to the ingest task
//! - signaling (`SignalingMessage`): WebRTC offer/answer/candidate exchange
//! - reporting (`StatusMessage`): buffer health sent back upstream

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Lowest sample rate accepted from the producer
pub const MIN_SAMPLE_RATE: u32 = 8_000;

/// Highest sample rate accepted from the producer
pub const MAX_SAMPLE_RATE: u32 = 192_000;

/// Highest channel count accepted from the producer
pub const MAX_CHANNELS: u16 = 8;

/// Negotiated PCM format of a stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Nominal frames per chunk announced by the producer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_frames: Option<u32>,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            chunk_frames: None,
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(ProtocolError::InvalidFormat(format!(
                "sample rate {} outside {}..={}",
                self.sample_rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
            )));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(ProtocolError::InvalidFormat(format!(
                "channel count {} outside 1..={}",
                self.channels, MAX_CHANNELS
            )));
        }
        Ok(())
    }

    /// Interleaved samples covering `ms` milliseconds, rounded up to whole frames
    pub fn samples_for_ms(&self, ms: f32) -> usize {
        self.frames_for_ms(ms) * self.channels as usize
    }

    /// Frames covering `ms` milliseconds, rounded up
    pub fn frames_for_ms(&self, ms: f32) -> usize {
        if ms <= 0.0 {
            return 0;
        }
        (ms as f64 * self.sample_rate as f64 / 1000.0).ceil() as usize
    }

    /// Duration of `samples` interleaved samples in milliseconds
    pub fn samples_to_ms(&self, samples: usize) -> f32 {
        let frames = samples / self.channels as usize;
        (frames as f64 * 1000.0 / self.sample_rate as f64) as f32
    }
}

/// Text control messages sent by the upstream producer on the PCM stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamMessage {
    AudioConfig {
        sample_rate: u32,
        channels: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_frames: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_ms: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bytes_per_sample: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sample_format: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interleaved: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_version: Option<u32>,
    },
    #[serde(other)]
    Unknown,
}

impl UpstreamMessage {
    /// Describe a format the way the producer announces it
    pub fn audio_config(format: &StreamFormat) -> Self {
        UpstreamMessage::AudioConfig {
            sample_rate: format.sample_rate,
            channels: format.channels,
            chunk_frames: format.chunk_frames,
            chunk_ms: None,
            bytes_per_sample: Some(2),
            sample_format: Some("s16le".to_string()),
            interleaved: Some(true),
            stream_version: Some(1),
        }
    }

    /// Convert an `audio_config` message into a validated stream format
    pub fn into_format(self) -> Result<StreamFormat, ProtocolError> {
        match self {
            UpstreamMessage::AudioConfig {
                sample_rate,
                channels,
                chunk_frames,
                chunk_ms,
                bytes_per_sample,
                sample_format,
                interleaved,
                ..
            } => {
                if bytes_per_sample.is_some_and(|b| b != 2) {
                    return Err(ProtocolError::InvalidFormat(format!(
                        "unsupported sample width {:?}",
                        bytes_per_sample
                    )));
                }
                if sample_format.as_deref().is_some_and(|f| f != "s16le") {
                    return Err(ProtocolError::InvalidFormat(format!(
                        "unsupported sample format {:?}",
                        sample_format
                    )));
                }
                if interleaved == Some(false) {
                    return Err(ProtocolError::InvalidFormat(
                        "planar payloads are not supported".to_string(),
                    ));
                }
                let chunk_frames = chunk_frames.or_else(|| {
                    chunk_ms.map(|ms| (ms as f64 * sample_rate as f64 / 1000.0).round() as u32)
                });
                let format = StreamFormat {
                    sample_rate,
                    channels,
                    chunk_frames,
                };
                format.validate()?;
                Ok(format)
            }
            UpstreamMessage::Unknown => Err(ProtocolError::MissingConfig),
        }
    }
}

/// Events consumed by the ingest task
#[derive(Debug, Clone)]
pub enum IngestMessage {
    /// (Re)configure the stream; always rebuilds the buffer
    Config(StreamFormat),
    /// Interleaved s16le payload
    Pcm(Bytes),
    /// Interleaved samples already normalized to f32 (decoded media track)
    Samples(Vec<f32>),
    /// Discard buffered audio and start filling again
    Reset,
}

/// WebRTC signaling messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMid", default)]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", default)]
        sdp_mline_index: Option<u16>,
    },
    Error {
        reason: String,
    },
    Close,
}

/// Buffer health report sent upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusMessage {
    BufferStatus {
        buffer_ms: f64,
        target_ms: Option<f64>,
        underruns: u64,
    },
}

/// Anything the client writes on a transport's control channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Signal(SignalingMessage),
    Status(StatusMessage),
}

impl Outbound {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_audio_config() {
        let text = r#"{"type":"audio_config","sample_rate":44100,"channels":2,"chunk_frames":1024,
            "bytes_per_sample":2,"sample_format":"s16le","interleaved":true,"stream_version":1}"#;
        let msg: UpstreamMessage = serde_json::from_str(text).unwrap();
        let format = msg.into_format().unwrap();
        assert_eq!(format.sample_rate, 44100);
        assert_eq!(format.channels, 2);
        assert_eq!(format.chunk_frames, Some(1024));
    }

    #[test]
    fn test_chunk_ms_converted_to_frames() {
        let text = r#"{"type":"audio_config","sample_rate":48000,"channels":1,"chunk_ms":20}"#;
        let msg: UpstreamMessage = serde_json::from_str(text).unwrap();
        assert_eq!(msg.into_format().unwrap().chunk_frames, Some(960));
    }

    #[test]
    fn test_unknown_message_is_not_a_config() {
        let msg: UpstreamMessage = serde_json::from_str(r#"{"type":"hello"}"#).unwrap();
        assert_eq!(msg, UpstreamMessage::Unknown);
        assert!(matches!(msg.into_format(), Err(ProtocolError::MissingConfig)));
    }

    #[test]
    fn test_invalid_format_rejected() {
        let text = r#"{"type":"audio_config","sample_rate":44100,"channels":0}"#;
        let msg: UpstreamMessage = serde_json::from_str(text).unwrap();
        assert!(matches!(msg.into_format(), Err(ProtocolError::InvalidFormat(_))));

        let text = r#"{"type":"audio_config","sample_rate":44100,"channels":2,"sample_format":"f32le"}"#;
        let msg: UpstreamMessage = serde_json::from_str(text).unwrap();
        assert!(msg.into_format().is_err());
    }

    #[test]
    fn test_candidate_field_names() {
        let msg = SignalingMessage::Candidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "candidate");
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);

        let parsed: SignalingMessage =
            serde_json::from_str(r#"{"type":"candidate","candidate":"c","sdpMid":null,"sdpMLineIndex":null}"#)
                .unwrap();
        assert!(matches!(parsed, SignalingMessage::Candidate { sdp_mid: None, .. }));
    }

    #[test]
    fn test_status_wire_shape() {
        let msg = Outbound::Status(StatusMessage::BufferStatus {
            buffer_ms: 42.5,
            target_ms: None,
            underruns: 3,
        });
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "buffer_status");
        assert_eq!(json["buffer_ms"], 42.5);
        assert!(json["target_ms"].is_null());
        assert_eq!(json["underruns"], 3);
    }

    #[test]
    fn test_frames_for_ms_rounds_up() {
        let format = StreamFormat::new(44100, 2);
        assert_eq!(format.frames_for_ms(120.0), 5292);
        assert_eq!(format.samples_for_ms(120.0), 10584);
        assert_eq!(format.frames_for_ms(0.0), 0);
    }
}
