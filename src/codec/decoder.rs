//! Opus decoder for the WebRTC media track
//!
//! Browsers and WebRTC peers always deliver Opus at 48 kHz. Lost packets are
//! concealed with Opus PLC so the buffer sees a continuous stream.

use opus::{Channels, Decoder};

use crate::error::CodecError;

/// Opus always runs its RTP clock at 48 kHz
pub const OPUS_SAMPLE_RATE: u32 = 48_000;

/// Opus decoder wrapper
pub struct OpusDecoder {
    decoder: Decoder,
    channels: u16,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<f32>,
    /// Packets decoded
    frames_decoded: u64,
    /// Packets concealed with PLC
    frames_lost: u64,
    /// Interleaved length of the last decoded packet; PLC matches it
    last_len: usize,
}

impl OpusDecoder {
    /// Create a new 48 kHz Opus decoder
    pub fn new(channels: u16) -> Result<Self, CodecError> {
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::DecoderInit(format!(
                    "Unsupported channel count: {}",
                    channels
                )))
            }
        };

        let decoder = Decoder::new(OPUS_SAMPLE_RATE, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        // 120ms at 48kHz is the longest Opus packet
        let decode_buffer = vec![0.0f32; OPUS_SAMPLE_RATE as usize * channels as usize * 120 / 1000];

        Ok(Self {
            decoder,
            channels,
            decode_buffer,
            frames_decoded: 0,
            frames_lost: 0,
            last_len: OPUS_SAMPLE_RATE as usize * channels as usize / 50,
        })
    }

    /// Decode one RTP payload into interleaved f32 samples
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, CodecError> {
        let samples = self
            .decoder
            .decode_float(data, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_decoded += 1;
        self.last_len = samples * self.channels as usize;
        Ok(self.decode_buffer[..self.last_len].to_vec())
    }

    /// Conceal one lost packet, as long as the last real one (20 ms initially)
    pub fn decode_plc(&mut self) -> Result<Vec<f32>, CodecError> {
        let samples = self
            .decoder
            .decode_float(&[], &mut self.decode_buffer[..self.last_len], false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_lost += 1;
        Ok(self.decode_buffer[..samples * self.channels as usize].to_vec())
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_lost: self.frames_lost,
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Copy)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_lost: u64,
}

impl DecoderStats {
    pub fn loss_rate(&self) -> f32 {
        let total = self.frames_decoded + self.frames_lost;
        if total == 0 {
            0.0
        } else {
            self.frames_lost as f32 / total as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_creation() {
        assert!(OpusDecoder::new(2).is_ok());
        assert!(OpusDecoder::new(6).is_err());
    }

    #[test]
    fn test_plc_counts_loss() {
        let mut decoder = OpusDecoder::new(2).unwrap();
        assert!(decoder.decode_plc().is_ok());

        let stats = decoder.stats();
        assert_eq!(stats.frames_lost, 1);
        assert_eq!(decoder.decode_plc().unwrap().len(), 960 * 2);
        assert_eq!(stats.loss_rate(), 1.0);
    }
}
