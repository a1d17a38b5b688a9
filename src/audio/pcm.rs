//! # PCM Framing
//!
//! Converts captured floating-point audio into the fixed wire format expected by the
//! remote engine, and converts received wire audio back into playable buffers.
//!
//! ## Wire Format:
//! - **Encoding**: 16-bit signed little-endian PCM
//! - **Channels**: Mono on the send path, declared per message on the receive path
//! - **Tag**: `audio/pcm;rate=<sample_rate>` travels with every outbound frame
//!
//! Everything in here is a pure function. There is no state to reset between sessions.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

/// Bytes per encoded sample (16-bit PCM)
pub const BYTES_PER_SAMPLE: usize = 2;

/// One encoded block of outbound audio.
///
/// Produced by [`encode`] and consumed by the outbound channel. Frames are never
/// modified after creation and are dropped once sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Little-endian i16 samples
    pub data: Vec<u8>,
    /// Sample rate the samples were produced at
    pub sample_rate: u32,
    /// MIME-like tag declaring the format, e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
}

impl AudioFrame {
    /// Number of samples carried by this frame.
    #[cfg(test)]
    pub fn sample_count(&self) -> usize {
        self.data.len() / BYTES_PER_SAMPLE
    }

    /// Base64 form of the payload, as the remote engine expects it inside JSON.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.data)
    }
}

/// A decoded buffer ready to be handed to the output device.
///
/// Samples are interleaved when `channels > 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PlaybackBuffer {
    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramerError {
    #[error("cannot encode an empty sample block")]
    EmptyInput,
}

/// Malformed inbound audio. Always local to the one message that carried it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("audio payload is empty")]
    Empty,

    #[error("channel count must be at least 1")]
    NoChannels,

    #[error("payload length {len} is not a multiple of {frame_bytes} bytes")]
    Misaligned { len: usize, frame_bytes: usize },

    #[error("payload is not valid base64: {0}")]
    Base64(String),
}

/// MIME-like tag for 16-bit PCM at the given rate.
pub fn mime_type_for(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the `rate=` parameter from a MIME-like audio tag.
///
/// Returns `None` when the tag carries no usable rate, e.g. `audio/pcm`.
pub fn mime_sample_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse::<u32>().ok())
        .filter(|rate| *rate > 0)
}

/// Encode float samples in [-1, 1] into a 16-bit PCM frame.
///
/// ## Conversion:
/// Each sample is clamped to [-1, 1] first, then scaled asymmetrically so that
/// -1.0 maps to -32768 and 1.0 maps to 32767.
pub fn encode(samples: &[f32], sample_rate: u32) -> Result<AudioFrame, FramerError> {
    if samples.is_empty() {
        return Err(FramerError::EmptyInput);
    }

    let mut data = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = data.write_i16::<LittleEndian>(float_to_i16(sample));
    }

    Ok(AudioFrame {
        data,
        sample_rate,
        mime_type: mime_type_for(sample_rate),
    })
}

/// Decode little-endian 16-bit PCM into a playable buffer.
///
/// Uses the same asymmetric scale as [`encode`], so a round trip stays within one
/// quantization step.
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<PlaybackBuffer, DecodeError> {
    if channels == 0 {
        return Err(DecodeError::NoChannels);
    }
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let frame_bytes = BYTES_PER_SAMPLE * channels as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(DecodeError::Misaligned {
            len: bytes.len(),
            frame_bytes,
        });
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / BYTES_PER_SAMPLE);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(i16_to_float(sample));
    }

    Ok(PlaybackBuffer {
        samples,
        sample_rate,
        channels,
    })
}

/// Decode a base64 payload as delivered inside the engine's JSON messages.
pub fn decode_base64(payload: &str, sample_rate: u32, channels: u16) -> Result<PlaybackBuffer, DecodeError> {
    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    decode(&bytes, sample_rate, channels)
}

fn float_to_i16(sample: f32) -> i16 {
    // NaN clamps to NaN, so map it to silence explicitly
    if sample.is_nan() {
        return 0;
    }
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

fn i16_to_float(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / 32768.0
    } else {
        sample as f32 / 32767.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUANTUM: f32 = 1.0 / 32767.0;

    #[test]
    fn test_round_trip_within_one_step() {
        let samples: Vec<f32> = (0..2000)
            .map(|i| ((i as f32) * 0.013).sin() * 0.9)
            .chain([-1.0, 1.0, 0.0, 0.5, -0.5, 1e-6])
            .collect();

        let frame = encode(&samples, 16000).unwrap();
        let decoded = decode(&frame.data, 16000, 1).unwrap();

        assert_eq!(decoded.samples.len(), samples.len());
        for (original, restored) in samples.iter().zip(decoded.samples.iter()) {
            let diff = (original - restored).abs();
            assert!(diff <= QUANTUM * 1.01, "{} vs {} (diff {})", original, restored, diff);
        }
    }

    #[test]
    fn test_encode_clamps_out_of_range() {
        let frame = encode(&[2.0, -3.0, f32::NAN], 16000).unwrap();
        let decoded = decode(&frame.data, 16000, 1).unwrap();
        assert_eq!(&frame.data[0..2], &32767i16.to_le_bytes());
        assert_eq!(&frame.data[2..4], &(-32768i16).to_le_bytes());
        assert_eq!(decoded.samples[2], 0.0);
    }

    #[test]
    fn test_encode_rejects_empty() {
        assert_eq!(encode(&[], 16000), Err(FramerError::EmptyInput));
    }

    #[test]
    fn test_frame_is_tagged_with_rate() {
        let frame = encode(&[0.1; 8], 16000).unwrap();
        assert_eq!(frame.mime_type, "audio/pcm;rate=16000");
        assert_eq!(frame.sample_count(), 8);
        assert_eq!(frame.data.len(), 16);
    }

    #[test]
    fn test_decode_rejects_misaligned_payloads() {
        assert!(matches!(decode(&[0u8; 3], 24000, 1), Err(DecodeError::Misaligned { .. })));
        // Whole samples but not whole stereo frames
        assert!(matches!(decode(&[0u8; 6], 24000, 2), Err(DecodeError::Misaligned { .. })));
        assert_eq!(decode(&[], 24000, 1), Err(DecodeError::Empty));
        assert_eq!(decode(&[0u8; 4], 24000, 0), Err(DecodeError::NoChannels));
    }

    #[test]
    fn test_decode_duration() {
        let buffer = decode(&vec![0u8; 48000], 24000, 1).unwrap();
        assert_eq!(buffer.frames(), 24000);
        assert!((buffer.duration() - 1.0).abs() < 1e-9);

        let stereo = decode(&vec![0u8; 48000], 24000, 2).unwrap();
        assert!((stereo.duration() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_capture_chunks_keep_sample_count() {
        for chunk in 0..10 {
            let samples: Vec<f32> = (0..4096)
                .map(|i| (((chunk * 4096 + i) as f32) * 0.01).sin())
                .collect();
            let frame = encode(&samples, 16000).unwrap();
            let decoded = decode(&frame.data, 16000, 1).unwrap();
            assert_eq!(frame.sample_count(), 4096);
            assert_eq!(decoded.samples.len(), 4096);
        }
    }

    #[test]
    fn test_base64_decode() {
        let frame = encode(&[0.25, -0.25], 24000).unwrap();
        let payload = frame.to_base64();
        let decoded = decode_base64(&payload, 24000, 1).unwrap();
        assert_eq!(decoded.samples.len(), 2);

        assert!(matches!(decode_base64("not base64!!", 24000, 1), Err(DecodeError::Base64(_))));
    }

    #[test]
    fn test_mime_sample_rate() {
        assert_eq!(mime_sample_rate("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(mime_sample_rate("audio/pcm; rate=16000"), Some(16000));
        assert_eq!(mime_sample_rate("audio/pcm"), None);
        assert_eq!(mime_sample_rate("audio/pcm;rate=abc"), None);
        assert_eq!(mime_sample_rate("audio/pcm;rate=0"), None);
    }
}
