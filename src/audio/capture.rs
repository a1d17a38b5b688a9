//! # Capture Pipeline
//!
//! Turns captured microphone blocks into outbound frames:
//! resample to the target rate → analyser tap → PCM encode.
//!
//! The send itself belongs to the session driver, which bounds it and keeps
//! listening for stop requests while it is in flight. A frame only counts as
//! sent once the driver reports it with [`CapturePipeline::record_sent`].
//!
//! ## Drop Policy:
//! A block that is ready while the channel is absent or not yet open is dropped.
//! Real-time audio has no replay value once stale, so nothing is buffered across
//! the not-yet-open boundary.

use crate::audio::analyser::SpectrumAnalyser;
use crate::audio::pcm::{self, AudioFrame};
use crate::audio::resample::{ResampleError, StreamResampler};
use tracing::{debug, info, warn};

/// What happened to one captured block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Encoded and ready for the channel
    Ready(AudioFrame),
    /// Held by the resampler until a full chunk has accumulated
    Buffered,
    Dropped,
}

/// Counters reported when the pipeline is torn down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub bytes_sent: u64,
}

pub struct CapturePipeline {
    target_rate: u32,
    resampler: Option<StreamResampler>,
    stats: CaptureStats,
}

impl CapturePipeline {
    pub fn new(target_rate: u32) -> Self {
        Self {
            target_rate,
            resampler: None,
            stats: CaptureStats::default(),
        }
    }

    /// Begin a run for an input delivering `native_rate` samples.
    ///
    /// The resampler is built here because the rate is only known once the
    /// capture device has been acquired.
    pub fn start(&mut self, native_rate: u32) -> Result<(), ResampleError> {
        self.resampler = Some(StreamResampler::new(native_rate, self.target_rate)?);
        self.stats = CaptureStats::default();
        debug!(native_rate, target_rate = self.target_rate, "Capture pipeline started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.resampler.is_some()
    }

    /// Push one captured block through resampling, analysis and encoding.
    ///
    /// The analyser sees every resampled block, whether or not it can be sent.
    pub fn prepare(&mut self, block: &[f32], analyser: &mut SpectrumAnalyser, channel_open: bool) -> CaptureOutcome {
        let Some(resampler) = self.resampler.as_mut() else {
            return CaptureOutcome::Dropped;
        };

        let samples = match resampler.process(block) {
            Ok(samples) => samples,
            Err(e) => {
                warn!(error = %e, "Skipping capture block the resampler rejected");
                self.stats.frames_dropped += 1;
                return CaptureOutcome::Dropped;
            }
        };
        if samples.is_empty() {
            return CaptureOutcome::Buffered;
        }

        analyser.push(&samples);

        if !channel_open {
            self.stats.frames_dropped += 1;
            return CaptureOutcome::Dropped;
        }

        match pcm::encode(&samples, self.target_rate) {
            Ok(frame) => CaptureOutcome::Ready(frame),
            Err(e) => {
                warn!(error = %e, "Skipping unencodable capture block");
                self.stats.frames_dropped += 1;
                CaptureOutcome::Dropped
            }
        }
    }

    pub fn record_sent(&mut self, frame: &AudioFrame) {
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += frame.data.len() as u64;
    }

    /// Stop accepting blocks. Returns the counters for the finished run.
    pub fn stop(&mut self) -> CaptureStats {
        if self.resampler.take().is_some() {
            info!(
                frames_sent = self.stats.frames_sent,
                frames_dropped = self.stats.frames_dropped,
                bytes_sent = self.stats.bytes_sent,
                "Capture pipeline stopped"
            );
        }
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::analyser::DEFAULT_FFT_SIZE;

    fn ready(outcome: CaptureOutcome) -> AudioFrame {
        match outcome {
            CaptureOutcome::Ready(frame) => frame,
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn test_blocks_dropped_until_channel_open() {
        let mut pipeline = CapturePipeline::new(16000);
        let mut analyser = SpectrumAnalyser::new(DEFAULT_FFT_SIZE);
        pipeline.start(16000).unwrap();

        assert_eq!(pipeline.prepare(&[0.1; 4096], &mut analyser, false), CaptureOutcome::Dropped);
        assert_eq!(pipeline.prepare(&[0.1; 4096], &mut analyser, false), CaptureOutcome::Dropped);

        let frame = ready(pipeline.prepare(&[0.1; 4096], &mut analyser, true));
        assert_eq!(frame.sample_count(), 4096);
        assert_eq!(frame.mime_type, "audio/pcm;rate=16000");
        pipeline.record_sent(&frame);

        let stats = pipeline.stop();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.frames_dropped, 2);
        assert_eq!(stats.bytes_sent, 8192);
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_native_rate_is_resampled_before_framing() {
        let mut pipeline = CapturePipeline::new(16000);
        let mut analyser = SpectrumAnalyser::new(DEFAULT_FFT_SIZE);
        pipeline.start(48000).unwrap();

        let mut sent = 0;
        for _ in 0..10 {
            if let CaptureOutcome::Ready(frame) = pipeline.prepare(&vec![0.2; 4800], &mut analyser, true) {
                assert_eq!(frame.sample_rate, 16000);
                assert_eq!(frame.mime_type, "audio/pcm;rate=16000");
                sent += frame.sample_count();
            }
        }

        // One second at 48 kHz becomes close to one second at 16 kHz
        assert!((15000..=16000).contains(&sent), "{}", sent);
    }

    #[test]
    fn test_short_blocks_wait_for_a_full_chunk() {
        let mut pipeline = CapturePipeline::new(16000);
        let mut analyser = SpectrumAnalyser::new(DEFAULT_FFT_SIZE);
        pipeline.start(48000).unwrap();

        assert_eq!(pipeline.prepare(&[0.1; 64], &mut analyser, true), CaptureOutcome::Buffered);
        assert_eq!(pipeline.stop().frames_dropped, 0);
    }

    #[test]
    fn test_stopped_pipeline_ignores_blocks() {
        let mut pipeline = CapturePipeline::new(16000);
        let mut analyser = SpectrumAnalyser::new(DEFAULT_FFT_SIZE);

        assert_eq!(pipeline.prepare(&[0.1; 128], &mut analyser, true), CaptureOutcome::Dropped);
        assert_eq!(pipeline.stop(), CaptureStats::default());
    }
}
