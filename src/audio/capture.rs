//! Microphone capture.
//!
//! Devices deliver audio in whatever block sizes they like. The
//! [`FrameAssembler`] regroups those blocks into fixed frames of
//! `CAPTURE_BUFFER_SIZE` samples, one [`AudioFrame`] per capture callback.

use std::sync::Arc;

use serde::Serialize;

use super::{AudioError, AUDIO_CHANNELS, CAPTURE_BUFFER_SIZE, INPUT_SAMPLE_RATE};

/// Receives every assembled capture frame. Called from the device thread.
pub type FrameCallback = Box<dyn FnMut(AudioFrame) + Send>;

/// What the session asks of the microphone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MicConstraints {
    pub sample_rate: u32,
    pub channel_count: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for MicConstraints {
    fn default() -> Self {
        Self {
            sample_rate: INPUT_SAMPLE_RATE,
            channel_count: AUDIO_CHANNELS,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// A granted microphone stream.
///
/// Frames only flow between `start` and `stop`. Dropping the microphone
/// releases the underlying device.
pub trait Microphone: Send {
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), AudioError>;

    /// Stop delivering frames and release the device. Idempotent.
    fn stop(&mut self);

    fn is_live(&self) -> bool;

    /// Human-readable device label for logs.
    fn label(&self) -> String {
        "microphone".to_string()
    }
}

/// One fixed-length block of captured mono samples.
///
/// Cloning shares the samples; the contents never change after capture.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Collects arbitrarily sized device blocks into fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Number of buffered samples not yet emitted.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Append a device block and return every frame it completed.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        let mut rest = samples;
        while !rest.is_empty() {
            let wanted = self.frame_size - self.pending.len();
            let take = wanted.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_size {
                let full = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                frames.push(AudioFrame::new(full));
            }
        }
        frames
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(CAPTURE_BUFFER_SIZE)
    }
}

/// Mix an interleaved device block down to mono.
pub fn downmix_interleaved(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_emits_fixed_frames() {
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push(&[0.1; 100]).is_empty());
        assert_eq!(assembler.pending(), 100);

        let frames = assembler.push(&[0.2; 500]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == CAPTURE_BUFFER_SIZE));
        assert_eq!(assembler.pending(), 600 - 512);

        assert_eq!(frames[0].samples()[99], 0.1);
        assert_eq!(frames[0].samples()[100], 0.2);
    }

    #[test]
    fn test_assembler_reset_drops_partial_frame() {
        let mut assembler = FrameAssembler::new(4);
        assembler.push(&[1.0, 2.0, 3.0]);
        assembler.reset();
        let frames = assembler.push(&[4.0, 5.0, 6.0, 7.0]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples(), &[4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_default_constraints() {
        let constraints = MicConstraints::default();
        assert_eq!(constraints.sample_rate, 16_000);
        assert_eq!(constraints.channel_count, 1);
        assert!(constraints.echo_cancellation);
        assert!(constraints.noise_suppression);
    }

    #[test]
    fn test_downmix_interleaved() {
        assert_eq!(downmix_interleaved(&[0.5, -0.5, 1.0, 0.0, 0.3], 2), vec![0.0, 0.5]);
        assert_eq!(downmix_interleaved(&[0.25, 0.5], 1), vec![0.25, 0.5]);
    }
}
