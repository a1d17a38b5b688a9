//! # Sample-Rate Conversion
//!
//! Band-limited resampling on top of `rubato`'s FFT resampler. Two shapes:
//!
//! - [`StreamResampler`]: one per capture run, fed block by block. Filter state
//!   carries across blocks, so there are no seams between consecutive frames.
//! - [`resample`]: one-shot conversion of a whole playback segment, with the
//!   filter delay trimmed so the output lines up with the input in time.

use rubato::{FftFixedIn, Resampler as _};
use thiserror::Error;

/// Input frames consumed per resampler pass.
const CHUNK_FRAMES: usize = 1024;

/// FFT sub-chunks per pass. More sub-chunks shorten latency at some filter cost.
const SUB_CHUNKS: usize = 2;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResampleError {
    #[error("cannot convert {from} Hz to {to} Hz: {reason}")]
    Construction { from: u32, to: u32, reason: String },

    #[error("resampling failed: {0}")]
    Process(String),
}

fn fft_resampler(from_rate: u32, to_rate: u32) -> Result<FftFixedIn<f32>, ResampleError> {
    if from_rate == 0 || to_rate == 0 {
        return Err(ResampleError::Construction {
            from: from_rate,
            to: to_rate,
            reason: "sample rates must be non-zero".to_string(),
        });
    }

    FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, CHUNK_FRAMES, SUB_CHUNKS, 1).map_err(|e| {
        ResampleError::Construction {
            from: from_rate,
            to: to_rate,
            reason: e.to_string(),
        }
    })
}

/// Streaming mono resampler.
///
/// Blocks of any length go in. Output is produced each time a full resampler
/// chunk has accumulated, so a short block may yield nothing until the next.
pub struct StreamResampler {
    inner: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    /// Matching rates give a passthrough that never buffers.
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, ResampleError> {
        let inner = if from_rate == to_rate {
            None
        } else {
            Some(fft_resampler(from_rate, to_rate)?)
        };

        Ok(Self {
            inner,
            pending: Vec::with_capacity(CHUNK_FRAMES * 2),
        })
    }

    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>, ResampleError> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);

        let mut output = Vec::new();
        let mut consumed = 0;
        loop {
            let needed = inner.input_frames_next();
            if self.pending.len() - consumed < needed {
                break;
            }

            let chunk = &self.pending[consumed..consumed + needed];
            let result = inner
                .process(&[chunk], None)
                .map_err(|e| ResampleError::Process(e.to_string()))?;
            if let Some(channel) = result.first() {
                output.extend_from_slice(channel);
            }
            consumed += needed;
        }

        self.pending.drain(..consumed);
        Ok(output)
    }
}

/// Convert a complete mono buffer from `from_rate` to `to_rate`.
///
/// The result has `len * to_rate / from_rate` samples (rounded) and is aligned
/// with the input: the resampler's output delay is cut from the front and the
/// tail is flushed with silence.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, ResampleError> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = fft_resampler(from_rate, to_rate)?;
    let delay = resampler.output_delay();
    let expected = (samples.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;

    // Enough trailing silence to push the delayed tail out, plus slack
    let flush_frames = (delay as f64 * from_rate as f64 / to_rate as f64).ceil() as usize + CHUNK_FRAMES * 2;
    let input_limit = samples.len() + flush_frames;

    let mut output = Vec::with_capacity(expected + delay + CHUNK_FRAMES);
    let mut position = 0;
    while output.len() < expected + delay && position < input_limit {
        let needed = resampler.input_frames_next();
        let mut chunk = vec![0.0f32; needed];
        if position < samples.len() {
            let end = (position + needed).min(samples.len());
            chunk[..end - position].copy_from_slice(&samples[position..end]);
        }
        position += needed;

        let result = resampler
            .process(&[&chunk], None)
            .map_err(|e| ResampleError::Process(e.to_string()))?;
        if let Some(channel) = result.first() {
            output.extend_from_slice(channel);
        }
    }

    output.drain(..delay.min(output.len()));
    output.resize(expected, 0.0);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sine(frequency: f32, rate: u32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * frequency * i as f32 / rate as f32).sin())
            .collect()
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn test_matching_rates_pass_through() {
        let mut resampler = StreamResampler::new(16000, 16000).unwrap();
        let block = sine(440.0, 16000, 4096, 0.5);
        assert_eq!(resampler.process(&block).unwrap(), block);
        assert_eq!(resample(&block, 16000, 16000).unwrap(), block);
    }

    #[test]
    fn test_stream_output_tracks_ratio() {
        let mut resampler = StreamResampler::new(48000, 16000).unwrap();
        let mut total = 0;
        for _ in 0..10 {
            total += resampler.process(&vec![0.2; 4800]).unwrap().len();
        }
        // One second in; at most one partial chunk is still buffered
        assert!(total <= 16000, "{}", total);
        assert!(total >= 16000 - CHUNK_FRAMES, "{}", total);
    }

    #[test]
    fn test_stream_rejects_energy_above_target_nyquist() {
        let mut resampler = StreamResampler::new(48000, 16000).unwrap();
        let tone = sine(12000.0, 48000, 48000, 0.5);

        let mut output = Vec::new();
        for block in tone.chunks(4800) {
            output.extend(resampler.process(block).unwrap());
        }

        // A 12 kHz tone has no place below 8 kHz; it must not fold back in
        let settled = &output[2000..];
        assert!(rms(settled) < 0.05, "aliased energy {}", rms(settled));
    }

    #[test]
    fn test_stream_keeps_in_band_signal() {
        let mut resampler = StreamResampler::new(48000, 16000).unwrap();
        let tone = sine(1000.0, 48000, 48000, 0.5);

        let mut output = Vec::new();
        for block in tone.chunks(4096) {
            output.extend(resampler.process(block).unwrap());
        }

        let settled = &output[2000..];
        assert!((rms(settled) - 0.5 / 2f32.sqrt()).abs() < 0.03, "{}", rms(settled));
    }

    #[test]
    fn test_one_shot_is_aligned_with_input() {
        let input = sine(100.0, 24000, 24000, 0.5);
        let output = resample(&input, 24000, 48000).unwrap();
        assert_eq!(output.len(), 48000);

        let expected = sine(100.0, 48000, 48000, 0.5);
        for i in (4000..44000).step_by(997) {
            assert!((output[i] - expected[i]).abs() < 0.05, "sample {}: {} vs {}", i, output[i], expected[i]);
        }
    }

    #[test]
    fn test_zero_rate_is_rejected() {
        assert!(matches!(
            StreamResampler::new(0, 16000),
            Err(ResampleError::Construction { from: 0, .. })
        ));
        assert!(resample(&[0.1; 16], 24000, 0).is_err());
    }
}
