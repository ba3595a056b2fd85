//! # PCM Codec
//!
//! Pure conversions between the three representations audio takes on its way
//! to and from the remote speech service:
//!
//! - **float samples**: normalized `f32` in `[-1.0, 1.0]`, what the audio graph works with
//! - **PCM16 bytes**: signed 16-bit little-endian integers, what the service speaks
//! - **base64 text**: the transport encoding inside JSON messages
//!
//! Nothing in here holds state or performs I/O, and nothing panics on bad
//! input: empty or odd-length buffers decode to silence.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::INPUT_MIME_TYPE;

/// Scale factor between normalized floats and PCM16 integers.
const PCM16_SCALE: f32 = 32768.0;

/// One unit of media on the wire: a mime tag plus base64 payload.
///
/// Constructed per frame/chunk and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportBlob {
    pub mime_type: String,
    pub data: String,
}

/// Decoded multi-channel audio, one `Vec<f32>` per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl PcmBuffer {
    /// Build a buffer from already de-interleaved channels.
    ///
    /// Channels are truncated to the shortest one so every channel has the
    /// same frame count.
    pub fn from_channels(sample_rate: u32, mut channels: Vec<Vec<f32>>) -> Self {
        let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
        for channel in &mut channels {
            channel.truncate(frames);
        }
        Self { sample_rate, channels }
    }

    /// A zero-length buffer with `channel_count` empty channels.
    pub fn empty(sample_rate: u32, channel_count: usize) -> Self {
        Self {
            sample_rate,
            channels: vec![Vec::new(); channel_count],
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Average all channels down to one, which is what the playback mixer renders.
    pub fn to_mono(&self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels[0].clone(),
            count => (0..self.frames())
                .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() / count as f32)
                .collect(),
        }
    }
}

/// Errors from the transport encoding layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The payload was not valid base64 text
    InvalidBase64(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::InvalidBase64(msg) => write!(f, "Invalid base64 payload: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

/// Base64-encode raw bytes with the standard alphabet.
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard-alphabet base64 text into raw bytes.
pub fn decode_base64(text: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))
}

/// Convert normalized float samples into PCM16 little-endian bytes.
///
/// Each sample is multiplied by 32768 and truncated toward zero. Values are
/// not clamped before scaling; anything past the i16 range saturates at the
/// integer conversion.
pub fn float_to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    let ints: Vec<i16> = samples.iter().map(|&s| (s * PCM16_SCALE) as i16).collect();
    let mut bytes = vec![0u8; ints.len() * 2];
    LittleEndian::write_i16_into(&ints, &mut bytes);
    bytes
}

/// Encode one captured frame into the outbound wire unit.
///
/// The mime tag always advertises the fixed 16 kHz capture rate.
pub fn encode_float_to_pcm_blob(samples: &[f32]) -> TransportBlob {
    TransportBlob {
        mime_type: INPUT_MIME_TYPE.to_string(),
        data: encode_base64(&float_to_pcm16_bytes(samples)),
    }
}

/// Decode PCM16 little-endian bytes into a de-interleaved float buffer.
///
/// An odd trailing byte is dropped, as is any trailing partial frame when
/// `channel_count > 1`. Empty input, a single byte, or `channel_count == 0`
/// all produce a zero-length buffer.
pub fn decode_pcm_blob_to_samples(bytes: &[u8], sample_rate: u32, channel_count: usize) -> PcmBuffer {
    if channel_count == 0 {
        return PcmBuffer::empty(sample_rate, 0);
    }

    let even_len = bytes.len() - (bytes.len() % 2);
    let mut ints = vec![0i16; even_len / 2];
    LittleEndian::read_i16_into(&bytes[..even_len], &mut ints);

    let frames = ints.len() / channel_count;
    let mut channels = vec![Vec::with_capacity(frames); channel_count];
    for frame in 0..frames {
        for (index, channel) in channels.iter_mut().enumerate() {
            channel.push(ints[frame * channel_count + index] as f32 / PCM16_SCALE);
        }
    }

    PcmBuffer { sample_rate, channels }
}

/// Decode a base64 inline audio payload straight into a float buffer.
pub fn decode_inline_audio(data: &str, sample_rate: u32, channel_count: usize) -> Result<PcmBuffer, CodecError> {
    let bytes = decode_base64(data)?;
    Ok(decode_pcm_blob_to_samples(&bytes, sample_rate, channel_count))
}

/// Interleave a multi-channel buffer back into a single sample stream.
pub fn interleave(buffer: &PcmBuffer) -> Vec<f32> {
    let channels = buffer.number_of_channels();
    let frames = buffer.frames();
    let mut out = Vec::with_capacity(frames * channels);
    for frame in 0..frames {
        for channel in &buffer.channels {
            out.push(channel[frame]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};

    #[test]
    fn test_round_trip_within_one_lsb() {
        let mut frame: Vec<f32> = (0..254).map(|i| ((i as f32) * 0.37).sin() * 0.99).collect();
        // Full scale: +1.0 saturates to 32767, -1.0 is exact
        frame.extend([1.0, -1.0]);
        let blob = encode_float_to_pcm_blob(&frame);
        let decoded = decode_inline_audio(&blob.data, INPUT_SAMPLE_RATE, 1).unwrap();

        assert_eq!(decoded.frames(), frame.len());
        for (original, restored) in frame.iter().zip(decoded.channel(0).unwrap()) {
            assert!((original - restored).abs() <= 1.0 / 32768.0, "{} vs {}", original, restored);
        }
    }

    #[test]
    fn test_exact_values_survive_round_trip() {
        let frame = vec![0.0, 0.5, -0.5, -1.0, 0.25, 16384.0 / 32768.0];
        let bytes = float_to_pcm16_bytes(&frame);
        let decoded = decode_pcm_blob_to_samples(&bytes, INPUT_SAMPLE_RATE, 1);
        assert_eq!(decoded.channel(0).unwrap(), frame.as_slice());
    }

    #[test]
    fn test_blob_is_tagged_with_capture_rate() {
        let blob = encode_float_to_pcm_blob(&[0.0; 256]);
        assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
        assert_eq!(blob.mime_type, format!("audio/pcm;rate={}", INPUT_SAMPLE_RATE));

        let decoded = decode_inline_audio(&blob.data, INPUT_SAMPLE_RATE, 1).unwrap();
        assert_eq!(decoded.frames(), 256);
        assert!(decoded.channel(0).unwrap().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_little_endian_layout() {
        let bytes = float_to_pcm16_bytes(&[0.5, -1.0]);
        assert_eq!(bytes, vec![0x00, 0x40, 0x00, 0x80]);
    }

    #[test]
    fn test_out_of_range_input_saturates() {
        let bytes = float_to_pcm16_bytes(&[1.5, -2.0]);
        let decoded = decode_pcm_blob_to_samples(&bytes, INPUT_SAMPLE_RATE, 1);
        assert_eq!(decoded.channel(0).unwrap(), &[32767.0 / 32768.0, -1.0]);
    }

    #[test]
    fn test_empty_and_odd_input_is_silence() {
        let empty = decode_pcm_blob_to_samples(&[], OUTPUT_SAMPLE_RATE, 1);
        assert!(empty.is_empty());
        assert_eq!(empty.duration(), 0.0);

        let single = decode_pcm_blob_to_samples(&[0x7f], OUTPUT_SAMPLE_RATE, 1);
        assert!(single.is_empty());

        let odd = decode_pcm_blob_to_samples(&[0x00, 0x40, 0x11], OUTPUT_SAMPLE_RATE, 1);
        assert_eq!(odd.channel(0).unwrap(), &[0.5]);

        let no_channels = decode_pcm_blob_to_samples(&[0x00, 0x40], OUTPUT_SAMPLE_RATE, 0);
        assert_eq!(no_channels.number_of_channels(), 0);
    }

    #[test]
    fn test_stereo_deinterleave_and_interleave() {
        let interleaved = [0.5f32, -0.5, 0.25, -0.25, 0.125];
        let bytes = float_to_pcm16_bytes(&interleaved);
        let buffer = decode_pcm_blob_to_samples(&bytes, OUTPUT_SAMPLE_RATE, 2);

        assert_eq!(buffer.frames(), 2);
        assert_eq!(buffer.channel(0).unwrap(), &[0.5, 0.25]);
        assert_eq!(buffer.channel(1).unwrap(), &[-0.5, -0.25]);
        assert_eq!(interleave(&buffer), vec![0.5, -0.5, 0.25, -0.25]);
        assert_eq!(buffer.to_mono(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_duration_uses_sample_rate() {
        let buffer = PcmBuffer::from_channels(OUTPUT_SAMPLE_RATE, vec![vec![0.0; 12_000]]);
        assert!((buffer.duration() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_base64_is_an_error() {
        assert!(matches!(
            decode_inline_audio("not base64 !!", OUTPUT_SAMPLE_RATE, 1),
            Err(CodecError::InvalidBase64(_))
        ));
    }
}
