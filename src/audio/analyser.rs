//! # Spectrum Analyser
//!
//! Turns the most recent captured input samples into a byte frequency snapshot
//! for the [`VolumeMeter`](crate::audio::meter::VolumeMeter).
//!
//! ## Pipeline per snapshot:
//! 1. Take the last `fft_size` samples (zero-padded if fewer have arrived)
//! 2. Apply a Blackman window and run a forward FFT
//! 3. Smooth each bin's magnitude against the previous snapshot
//! 4. Convert to dB and map [-100 dB, -30 dB] onto 0..255

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::collections::VecDeque;
use std::sync::Arc;

pub const DEFAULT_FFT_SIZE: usize = 256;
pub const MIN_DECIBELS: f32 = -100.0;
pub const MAX_DECIBELS: f32 = -30.0;
pub const SMOOTHING: f32 = 0.8;

pub struct SpectrumAnalyser {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    history: VecDeque<f32>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
}

impl SpectrumAnalyser {
    /// `fft_size` must be a power of two; config validation enforces this.
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(2);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);

        Self {
            fft_size,
            fft,
            window: blackman(fft_size),
            history: VecDeque::from(vec![0.0; fft_size]),
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
            smoothed: vec![0.0; fft_size / 2],
        }
    }

    /// Feed captured samples. Only the last `fft_size` are retained.
    pub fn push(&mut self, samples: &[f32]) {
        let skip = samples.len().saturating_sub(self.fft_size);
        for &sample in &samples[skip..] {
            if self.history.len() == self.fft_size {
                self.history.pop_front();
            }
            self.history.push_back(if sample.is_finite() { sample } else { 0.0 });
        }
    }

    /// Compute the current byte frequency snapshot.
    pub fn byte_frequency_data(&mut self) -> Vec<u8> {
        for (i, (slot, sample)) in self.scratch.iter_mut().zip(self.history.iter()).enumerate() {
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let scale = 1.0 / self.fft_size as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;

        self.smoothed
            .iter_mut()
            .zip(self.scratch.iter())
            .map(|(smoothed, bin)| {
                let magnitude = bin.norm() * scale;
                *smoothed = SMOOTHING * *smoothed + (1.0 - SMOOTHING) * magnitude;

                let db = if *smoothed > 0.0 {
                    20.0 * smoothed.log10()
                } else {
                    f32::NEG_INFINITY
                };
                let scaled = 255.0 * (db - MIN_DECIBELS) / range;
                scaled.clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Forget all input and smoothing state.
    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|s| *s = 0.0);
        self.smoothed.iter_mut().for_each(|s| *s = 0.0);
    }
}

fn blackman(n: usize) -> Vec<f32> {
    let alpha = 0.16_f32;
    let a0 = 0.5 * (1.0 - alpha);
    let a1 = 0.5_f32;
    let a2 = 0.5 * alpha;
    (0..n)
        .map(|i| {
            let x = i as f32 / n as f32;
            let two_pi_x = 2.0 * std::f32::consts::PI * x;
            a0 - a1 * two_pi_x.cos() + a2 * (2.0 * two_pi_x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::meter::VolumeMeter;

    fn tone(len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 2.0 * std::f32::consts::PI * 1000.0 / 16000.0).sin() * amplitude)
            .collect()
    }

    #[test]
    fn test_silence_is_all_zero() {
        let mut analyser = SpectrumAnalyser::new(DEFAULT_FFT_SIZE);
        analyser.push(&vec![0.0; 1024]);
        let bins = analyser.byte_frequency_data();
        assert_eq!(bins.len(), DEFAULT_FFT_SIZE / 2);
        assert!(bins.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_loud_input_raises_the_meter() {
        let mut analyser = SpectrumAnalyser::new(DEFAULT_FFT_SIZE);
        let mut meter = VolumeMeter::new();

        // Several snapshots so smoothing converges
        let mut level = 0.0;
        for _ in 0..20 {
            analyser.push(&tone(4096, 0.8));
            level = meter.sample(&analyser.byte_frequency_data());
        }
        assert!(level > 0.0);

        analyser.reset();
        assert_eq!(meter.sample(&analyser.byte_frequency_data()), 0.0);
    }

    #[test]
    fn test_short_pushes_accumulate() {
        let mut analyser = SpectrumAnalyser::new(64);
        analyser.push(&[0.5; 10]);
        analyser.push(&[0.5; 10]);
        assert_eq!(analyser.history.len(), 64);
        assert_eq!(analyser.history.iter().filter(|&&s| s == 0.5).count(), 20);
    }
}
