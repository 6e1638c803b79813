//! Audio pipeline for the live call: capture, wire codec, level metering,
//! and scheduled gapless playback.
//!
//! The remote service consumes 16 kHz mono and answers at 24 kHz mono;
//! device-native rates are converted at the edges.

/// Sample rate of outbound (microphone) audio.
pub const CAPTURE_RATE: u32 = 16_000;

/// Sample rate of inbound (synthesized) audio.
pub const PLAYBACK_RATE: u32 = 24_000;

/// Capture block size in samples at [`CAPTURE_RATE`] (256 ms).
pub const CAPTURE_BLOCK_SAMPLES: usize = 4_096;

mod capture;
mod codec;
mod dispatch;
mod meter;
mod playback;
mod resample;

pub use capture::{CaptureSource, CaptureStream};
pub use codec::{decode_pcm16, encode_pcm16, from_base64, to_base64, BYTES_PER_SAMPLE};
pub use meter::{LevelMeter, METER_FLOOR_DB};
pub use playback::{PlaybackScheduler, PlaybackSink, Scheduled};

pub(crate) use meter::rms_db;
pub(crate) use resample::convert_block;
