//! PCM16 wire codec for the live transport boundary.
//!
//! The remote service consumes 16-bit little-endian PCM and returns the same;
//! base64 wrapping happens only at the message edge. Encoding is lossy in
//! amplitude (quantization) but never in sample count or ordering.

use anyhow::{bail, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Width of one encoded sample on the wire.
pub const BYTES_PER_SAMPLE: usize = 2;

const PCM_SCALE: f32 = 32_767.0;

/// Encode a block of f32 samples in [-1, 1] as 16-bit little-endian PCM.
pub fn encode_pcm16(frame: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frame.len() * BYTES_PER_SAMPLE);
    for &sample in frame {
        let quantized = (sample.clamp(-1.0, 1.0) * PCM_SCALE).round() as i16;
        bytes.extend_from_slice(&quantized.to_le_bytes());
    }
    bytes
}

/// Decode 16-bit little-endian PCM back into f32 samples.
///
/// Fails when the byte length is not a multiple of the sample width; a
/// truncated chunk would silently shift every later sample otherwise.
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>> {
    if !bytes.len().is_multiple_of(BYTES_PER_SAMPLE) {
        bail!(
            "malformed chunk: {} bytes is not a multiple of the {BYTES_PER_SAMPLE}-byte sample width",
            bytes.len()
        );
    }
    let mut frame = Vec::with_capacity(bytes.len() / BYTES_PER_SAMPLE);
    for pair in bytes.chunks_exact(BYTES_PER_SAMPLE) {
        let raw = i16::from_le_bytes([pair[0], pair[1]]);
        frame.push((raw as f32 / PCM_SCALE).clamp(-1.0, 1.0));
    }
    Ok(frame)
}

/// Base64-wrap an encoded chunk for the wire message.
pub fn to_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Unwrap a base64 payload from an inbound wire message.
pub fn from_base64(data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data)
        .map_err(|err| anyhow::anyhow!("invalid base64 audio payload: {err}"))
}
