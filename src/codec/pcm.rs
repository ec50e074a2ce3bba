//! Signed 16-bit little-endian PCM normalization

use crate::error::CodecError;

const SCALE: f32 = 1.0 / 32768.0;

/// Decode interleaved s16le bytes into f32 samples in `[-1.0, 1.0)`.
///
/// `out` is cleared and reused so steady-state decoding does not allocate.
pub fn decode_s16le(bytes: &[u8], out: &mut Vec<f32>) -> Result<(), CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::TruncatedSample(bytes.len()));
    }
    out.clear();
    out.extend(
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 * SCALE),
    );
    Ok(())
}

/// Encode f32 samples as interleaved s16le, clamping to the i16 range
pub fn encode_s16le(samples: &[f32], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(samples.len() * 2);
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
}
