//! # Playback Mixer
//!
//! Sample-accurate timeline of scheduled segments at one output rate. Segments
//! are placed by start time and summed where they overlap, so a frame-driven
//! output (a sound card callback, or a WAV render at the end of a session)
//! can pull any window of the conversation.

use crate::audio::pcm::PlaybackBuffer;
use crate::audio::resample::{resample, ResampleError};

/// Average interleaved frames down to one channel.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Convert a decoded buffer to mono samples at `rate`, ready for [`Mixer::insert`].
pub fn prepare_segment(buffer: &PlaybackBuffer, rate: u32) -> Result<Vec<f32>, ResampleError> {
    let mono = downmix(&buffer.samples, buffer.channels.max(1) as usize);
    resample(&mono, buffer.sample_rate, rate)
}

struct MixSegment {
    id: u64,
    start_frame: u64,
    samples: Vec<f32>,
}

impl MixSegment {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

pub struct Mixer {
    rate: u32,
    segments: Vec<MixSegment>,
}

impl Mixer {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            segments: Vec::new(),
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Convert seconds on the device timeline to a frame index.
    pub fn frame_at(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.rate as f64).round() as u64
    }

    /// Place `buffer` at `start` seconds, converted to mono at the mixer rate.
    pub fn add(&mut self, buffer: &PlaybackBuffer, start: f64, id: u64) -> Result<(), ResampleError> {
        let samples = prepare_segment(buffer, self.rate)?;
        self.insert(samples, start, id);
        Ok(())
    }

    /// Place samples already at the mixer rate.
    ///
    /// Lets a caller that shares the mixer with a real-time callback do the
    /// conversion before taking the lock.
    pub fn insert(&mut self, samples: Vec<f32>, start: f64, id: u64) {
        self.segments.push(MixSegment {
            id,
            start_frame: self.frame_at(start),
            samples,
        });
    }

    /// Sum every segment overlapping `[begin, begin + out.len())` into `out`.
    pub fn mix(&self, begin: u64, out: &mut [f32]) {
        out.fill(0.0);
        let end = begin + out.len() as u64;

        for segment in &self.segments {
            if segment.end_frame() <= begin || segment.start_frame >= end {
                continue;
            }
            let from = segment.start_frame.max(begin);
            let to = segment.end_frame().min(end);
            for frame in from..to {
                out[(frame - begin) as usize] += segment.samples[(frame - segment.start_frame) as usize];
            }
        }
    }

    /// Drop segments that have fully played by frame `now`. Returns their ids.
    #[cfg_attr(not(feature = "system-audio"), allow(dead_code))]
    pub fn retire(&mut self, now: u64) -> Vec<u64> {
        let mut finished = Vec::new();
        self.segments.retain(|segment| {
            let done = segment.end_frame() <= now;
            if done {
                finished.push(segment.id);
            }
            !done
        });
        finished
    }

    /// Drop everything that has not started by frame `now`. Returns how many.
    pub fn discard_unstarted(&mut self, now: u64) -> usize {
        let before = self.segments.len();
        self.segments.retain(|segment| segment.start_frame <= now);
        before - self.segments.len()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }
}
