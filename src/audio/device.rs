//! # Audio Devices
//!
//! Contracts for the capture and playback devices a session owns, plus the
//! headless file backend. The sound card backend lives in `audio::system`.
//!
//! ## Contracts:
//! - **AudioInput**: exclusive mono capture stream yielding fixed-size blocks at its native rate
//! - **AudioOutput**: monotonic clock plus scheduled playback with completion notifications
//! - **DeviceProvider**: acquires both, may suspend (e.g. pending user permission)
//!
//! ## File backend:
//! - **WavFileInput**: streams a WAV file paced in real time, then continues with silence.
//!   Without a file it is silent from the start.
//! - **ClockOutput**: paces playback on the tokio clock and can render the conversation to a WAV file

use crate::audio::mixer::{downmix, Mixer};
use crate::audio::pcm::PlaybackBuffer;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Rate of the silent capture source used when no input file is configured.
pub const SILENT_INPUT_RATE: u32 = 16_000;

/// Completion notifications carry the id the scheduler assigned to a segment.
pub type CompletionSender = mpsc::UnboundedSender<u64>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("audio device unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied for audio device: {0}")]
    PermissionDenied(String),

    #[error("audio device has been released")]
    Released,

    #[error("audio device I/O error: {0}")]
    Io(String),
}

#[async_trait]
pub trait AudioInput: Send {
    /// Native sample rate of the blocks this device yields.
    fn sample_rate(&self) -> u32;

    /// Wait for the next captured block. `None` means the device stopped.
    async fn read_chunk(&mut self) -> Option<Vec<f32>>;

    /// Stop capturing and give the device back. Idempotent.
    fn release(&mut self);

    fn is_released(&self) -> bool;
}

pub trait AudioOutput: Send {
    /// Seconds since the device was acquired. Never decreases.
    fn current_time(&self) -> f64;

    /// Schedule `buffer` to begin at `start` on the device timeline.
    ///
    /// The device reports `id` on its completion channel once playback ends.
    fn schedule(&mut self, buffer: PlaybackBuffer, start: f64, id: u64) -> Result<(), DeviceError>;

    /// Stop playback, drop every segment that has not started yet. Idempotent.
    fn release(&mut self);

    fn is_released(&self) -> bool;
}

#[async_trait]
pub trait DeviceProvider: Send + Sync {
    async fn acquire_input(&self, block_size: usize) -> Result<Box<dyn AudioInput>, DeviceError>;

    async fn acquire_output(
        &self,
        sample_rate: u32,
        completions: CompletionSender,
    ) -> Result<Box<dyn AudioOutput>, DeviceError>;
}

/// Devices backed by local files and the tokio clock.
///
/// ## Fields:
/// - `input_wav`: replayed as the microphone. `None` streams silence, which
///   still lets the engine speak first when a begin message is configured
/// - `output_wav`: the played conversation is written here on release
#[derive(Debug, Clone, Default)]
pub struct LocalDevices {
    pub input_wav: Option<PathBuf>,
    pub output_wav: Option<PathBuf>,
}

impl LocalDevices {
    pub fn new(input_wav: Option<PathBuf>, output_wav: Option<PathBuf>) -> Self {
        Self { input_wav, output_wav }
    }
}

#[async_trait]
impl DeviceProvider for LocalDevices {
    async fn acquire_input(&self, block_size: usize) -> Result<Box<dyn AudioInput>, DeviceError> {
        let Some(path) = self.input_wav.clone() else {
            info!(sample_rate = SILENT_INPUT_RATE, block_size, "No capture file, streaming silence");
            return Ok(Box::new(WavFileInput::new(Vec::new(), SILENT_INPUT_RATE, block_size)));
        };

        let (samples, sample_rate) = tokio::task::spawn_blocking(move || read_wav_mono(&path))
            .await
            .map_err(|e| DeviceError::Io(e.to_string()))??;

        info!(
            sample_rate,
            samples = samples.len(),
            block_size,
            "Capture source acquired"
        );
        Ok(Box::new(WavFileInput::new(samples, sample_rate, block_size)))
    }

    async fn acquire_output(
        &self,
        sample_rate: u32,
        completions: CompletionSender,
    ) -> Result<Box<dyn AudioOutput>, DeviceError> {
        if sample_rate == 0 {
            return Err(DeviceError::Unavailable("output sample rate must be non-zero".to_string()));
        }
        info!(sample_rate, recording = self.output_wav.is_some(), "Playback device acquired");
        Ok(Box::new(ClockOutput::new(sample_rate, completions, self.output_wav.clone())))
    }
}

/// Read a WAV file and downmix it to mono floats.
pub fn read_wav_mono(path: &Path) -> Result<(Vec<f32>, u32), DeviceError> {
    let mut file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => DeviceError::PermissionDenied(path.display().to_string()),
        _ => DeviceError::Unavailable(format!("{}: {}", path.display(), e)),
    })?;

    let (header, data) = wav::read(&mut file).map_err(|e| DeviceError::Io(e.to_string()))?;
    let channels = header.channel_count.max(1) as usize;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
        wav::BitDepth::Sixteen(samples) => samples.iter().map(|&s| s as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(samples) => samples.iter().map(|&s| s as f32 / 8_388_608.0).collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
    };

    Ok((downmix(&interleaved, channels), header.sampling_rate))
}

/// Write mono floats as a 16-bit PCM WAV file.
pub fn write_wav_mono(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), DeviceError> {
    let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, sample_rate, 16);
    let pcm: Vec<i16> = samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect();

    let mut file = File::create(path).map_err(|e| DeviceError::Io(format!("{}: {}", path.display(), e)))?;
    wav::write(header, &wav::BitDepth::Sixteen(pcm), &mut file).map_err(|e| DeviceError::Io(e.to_string()))
}

/// Capture source that replays a decoded WAV file at real-time pace.
///
/// Once the file is exhausted it keeps yielding silent blocks, which keeps the
/// conversation open for the remote side to answer.
pub struct WavFileInput {
    samples: Vec<f32>,
    sample_rate: u32,
    block_size: usize,
    position: usize,
    ticker: Interval,
    released: bool,
}

impl WavFileInput {
    pub fn new(samples: Vec<f32>, sample_rate: u32, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        let period = Duration::from_secs_f64(block_size as f64 / sample_rate.max(1) as f64);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            samples,
            sample_rate,
            block_size,
            position: 0,
            ticker,
            released: false,
        }
    }
}

#[async_trait]
impl AudioInput for WavFileInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn read_chunk(&mut self) -> Option<Vec<f32>> {
        if self.released {
            return None;
        }
        self.ticker.tick().await;

        let mut block = vec![0.0; self.block_size];
        if self.position < self.samples.len() {
            let end = (self.position + self.block_size).min(self.samples.len());
            block[..end - self.position].copy_from_slice(&self.samples[self.position..end]);
            self.position = end;
            if self.position == self.samples.len() {
                debug!("Capture source exhausted, continuing with silence");
            }
        }
        Some(block)
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.samples = Vec::new();
            debug!("Capture source released");
        }
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for WavFileInput {
    fn drop(&mut self) {
        self.release();
    }
}

/// Playback device paced on the tokio clock.
///
/// Completion of each segment is signalled when the clock passes its end. When an
/// output path is configured, every segment that actually started is kept in a
/// [`Mixer`] and the mixed conversation is written out on release.
pub struct ClockOutput {
    origin: Instant,
    completions: CompletionSender,
    timers: HashMap<u64, JoinHandle<()>>,
    recording: Option<(PathBuf, Mixer)>,
    released: bool,
}

impl ClockOutput {
    pub fn new(sample_rate: u32, completions: CompletionSender, record_to: Option<PathBuf>) -> Self {
        Self {
            origin: Instant::now(),
            completions,
            timers: HashMap::new(),
            recording: record_to.map(|path| (path, Mixer::new(sample_rate))),
            released: false,
        }
    }
}

impl AudioOutput for ClockOutput {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, buffer: PlaybackBuffer, start: f64, id: u64) -> Result<(), DeviceError> {
        if self.released {
            return Err(DeviceError::Released);
        }

        if let Some((_, mixer)) = self.recording.as_mut() {
            mixer
                .add(&buffer, start, id)
                .map_err(|e| DeviceError::Io(e.to_string()))?;
        }

        let end = start + buffer.duration();
        let deadline = self.origin + Duration::from_secs_f64(end.max(0.0));
        let completions = self.completions.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = completions.send(id);
        });

        self.timers.retain(|_, timer| !timer.is_finished());
        self.timers.insert(id, timer);
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let cancelled = self.timers.values().filter(|timer| !timer.is_finished()).count();
        for timer in self.timers.values() {
            timer.abort();
        }
        self.timers.clear();

        let now = self.current_time();
        if let Some((path, mut mixer)) = self.recording.take() {
            mixer.discard_unstarted(mixer.frame_at(now));
            let mut timeline = vec![0.0f32; mixer.frame_at(now) as usize];
            mixer.mix(0, &mut timeline);

            match write_wav_mono(&path, &timeline, mixer.rate()) {
                Ok(()) => info!(path = %path.display(), seconds = now, segments = mixer.len(), "Conversation audio written"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to write conversation audio"),
            }
            mixer.clear();
        }

        debug!(cancelled, "Playback device released");
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for ClockOutput {
    fn drop(&mut self) {
        self.release();
    }
}
