//! Audio frame pipeline.
//!
//! Everything between the telephony wire and the AI provider passes through
//! here: G.711 μ-law decoding, fixed-cadence framing, sample-rate conversion
//! and the bounded per-direction queues with reason-tagged drop accounting.
//!
//! # Formats
//!
//! - Telephony wire: G.711 μ-law, 8kHz, mono, 20ms frames (160 bytes)
//! - Internal: PCM 16-bit signed samples (`i16`)
//! - Providers: PCM 16-bit little-endian at the provider's native rate

mod codec;
mod frame;
mod queue;
mod resample;

pub use codec::{
    decode_mulaw, encode_mulaw, linear_to_mulaw, mulaw_to_linear, pcm16_from_le_bytes,
    pcm16_to_le_bytes,
};
pub use frame::{AudioFrame, FRAME_DURATION_MS, FrameAssembler, FrameDirection, samples_per_frame};
pub use queue::{DropCounters, DropReason, DropSnapshot, FrameQueue};
pub use resample::StreamingResampler;

use thiserror::Error;

/// Telephony wire sample rate (G.711).
pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;

/// Errors raised by the audio pipeline.
#[derive(Debug, Error)]
pub enum AudioError {
    /// A sample rate of zero or otherwise unusable value
    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    /// Payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// PCM byte buffer with an odd length
    #[error("Misaligned PCM buffer of {0} bytes")]
    MisalignedPcm(usize),

    #[error("Resampler error: {0}")]
    Resample(String),
}

/// Result type for audio operations.
pub type AudioResult<T> = Result<T, AudioError>;
