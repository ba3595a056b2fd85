//! # Audio Module
//!
//! Everything that touches samples: the PCM transport codec, the audio graph
//! (contexts, nodes, scheduled playback), microphone capture, amplitude
//! analysis for visualizers, and the backends that bind all of it to either a
//! real sound device or a headless clock.
//!
//! ## Fixed formats:
//! - **Capture**: 16 kHz, mono, frames of 256 samples
//! - **Playback**: 24 kHz, mono
//! - **Transport**: PCM16 little-endian, base64 encoded

use std::fmt;

pub mod analyzer;   // Frequency-magnitude snapshots for visualizers
pub mod backend;    // Context + microphone providers (headless / device)
pub mod capture;    // Microphone trait and fixed-size frame assembly
pub mod codec;      // float <-> PCM16 <-> base64
pub mod contexts;   // Owner of the capture and playback contexts
pub mod graph;      // AudioContext, AudioNode, playback mixer

#[cfg(feature = "device-audio")]
pub mod device;     // cpal-backed backend

pub use analyzer::AmplitudeAnalyzer;
pub use backend::{AudioBackend, HeadlessBackend};
pub use capture::{AudioFrame, FrameAssembler, MicConstraints, Microphone};
pub use codec::{PcmBuffer, TransportBlob};
pub use contexts::AudioContexts;
pub use graph::{AudioContext, AudioNode, ContextState, SourceId, WeakAudioContext};

/// Microphone capture rate sent to the remote service.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Rate of the audio the remote service streams back.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Both directions are mono.
pub const AUDIO_CHANNELS: usize = 1;

/// Samples per capture frame (one capture callback).
pub const CAPTURE_BUFFER_SIZE: usize = 256;

/// FFT size of the visualizer analysis node.
pub const ANALYZER_FFT_SIZE: usize = 32;

/// Mime tag for outbound media; must agree with `INPUT_SAMPLE_RATE`.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Errors raised by the audio graph, the backends, and capture devices.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    /// Operation against a context (or a node of a context) that was closed
    ContextClosed,

    /// Two nodes from different contexts cannot be wired together
    ContextMismatch { expected: u64, found: u64 },

    /// Buffer rate differs from the context it is played on
    SampleRateMismatch { expected: u32, found: u32 },

    /// The platform audio subsystem refused to create a context
    ContextCreation(String),

    /// A suspended context could not be resumed
    Resume(String),

    /// The user or the OS denied microphone access
    MicrophoneDenied(String),

    /// No usable input device, or it does not support the capture format
    MicrophoneUnavailable(String),

    /// Any other device-level failure
    Device(String),
}

impl fmt::Display for AudioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioError::ContextClosed => write!(f, "Audio context is closed"),
            AudioError::ContextMismatch { expected, found } => write!(
                f,
                "Cannot connect nodes across audio contexts (expected context {}, got {})",
                expected, found
            ),
            AudioError::SampleRateMismatch { expected, found } => write!(
                f,
                "Sample rate mismatch: context runs at {} Hz, buffer is {} Hz",
                expected, found
            ),
            AudioError::ContextCreation(msg) => write!(f, "Failed to create audio context: {}", msg),
            AudioError::Resume(msg) => write!(f, "Failed to resume audio context: {}", msg),
            AudioError::MicrophoneDenied(msg) => write!(f, "Microphone access denied: {}", msg),
            AudioError::MicrophoneUnavailable(msg) => write!(f, "Microphone unavailable: {}", msg),
            AudioError::Device(msg) => write!(f, "Audio device error: {}", msg),
        }
    }
}

impl std::error::Error for AudioError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_type_matches_capture_rate() {
        assert_eq!(INPUT_MIME_TYPE, format!("audio/pcm;rate={}", INPUT_SAMPLE_RATE));
    }

    #[test]
    fn test_analyzer_fft_size_is_power_of_two() {
        assert!(ANALYZER_FFT_SIZE.is_power_of_two());
    }
}
