//! # System Audio Devices
//!
//! Microphone and speaker through the host audio API (`cpal`).
//!
//! ## Threading:
//! `cpal::Stream` is `!Send` on some hosts, so each stream lives on its own OS
//! thread for its whole life. The thread opens the device, reports the
//! negotiated format back over a oneshot, then parks until the session
//! releases the device. Audio crosses the boundary through channels (capture)
//! or a mutex-guarded [`Mixer`] (playback); nothing in a callback blocks on
//! the async runtime.
//!
//! ## Capture:
//! The input callback converts whatever sample format the device delivers to
//! `f32`, downmixes to mono and cuts fixed-size blocks. Blocks go over a
//! bounded queue with `try_send`; when the session falls behind, blocks are
//! dropped and counted rather than queued.
//!
//! ## Playback:
//! The output callback pulls the next window from the mixer and advances a
//! frame counter. That counter is the device clock behind `current_time`, and
//! a segment's completion is reported from the callback that plays its last
//! frame.

use crate::audio::device::{AudioInput, AudioOutput, CompletionSender, DeviceError, DeviceProvider};
use crate::audio::mixer::{downmix, prepare_segment, Mixer};
use crate::audio::pcm::PlaybackBuffer;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig, SupportedStreamConfig};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

/// Captured blocks allowed to wait for the session before new ones are dropped.
const CAPTURE_QUEUE_BLOCKS: usize = 8;

/// Sound card devices, by name or the host defaults.
#[derive(Debug, Clone, Default)]
pub struct SystemDevices {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl SystemDevices {
    pub fn new(input_device: Option<String>, output_device: Option<String>) -> Self {
        Self {
            input_device,
            output_device,
        }
    }
}

#[async_trait]
impl DeviceProvider for SystemDevices {
    async fn acquire_input(&self, block_size: usize) -> Result<Box<dyn AudioInput>, DeviceError> {
        let name = self.input_device.clone();
        let (blocks_tx, blocks) = mpsc::channel(CAPTURE_QUEUE_BLOCKS);

        let (ready, stop) = spawn_stream_thread("voice-capture", move || {
            open_input(name.as_deref(), block_size.max(1), blocks_tx)
        })?;
        let sample_rate = ready
            .await
            .map_err(|_| DeviceError::Io("capture thread exited during setup".to_string()))??;

        Ok(Box::new(SystemInput {
            sample_rate,
            blocks,
            stop: Some(stop),
        }))
    }

    async fn acquire_output(
        &self,
        sample_rate: u32,
        completions: CompletionSender,
    ) -> Result<Box<dyn AudioOutput>, DeviceError> {
        let name = self.output_device.clone();

        let (ready, stop) = spawn_stream_thread("voice-playback", move || {
            open_output(name.as_deref(), sample_rate, completions)
        })?;
        let (timeline, rate) = ready
            .await
            .map_err(|_| DeviceError::Io("playback thread exited during setup".to_string()))??;

        Ok(Box::new(SystemOutput {
            timeline,
            rate,
            stop: Some(stop),
        }))
    }
}

/// Run `open` on a dedicated thread that owns the resulting stream.
///
/// The thread holds the stream until the returned stop sender fires or is
/// dropped. If the caller gives up before the device is ready, the thread
/// notices the closed oneshot and drops the stream right away.
fn spawn_stream_thread<T, F>(
    name: &str,
    open: F,
) -> Result<(oneshot::Receiver<Result<T, DeviceError>>, std_mpsc::Sender<()>), DeviceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<(Stream, T), DeviceError> + Send + 'static,
{
    let (ready_tx, ready_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match open() {
                Ok((stream, value)) => {
                    if ready_tx.send(Ok(value)).is_err() {
                        return;
                    }
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            // Parks until released; a dropped handle also ends the wait
            let _ = stop_rx.recv();
            drop(stream);
            debug!("Audio stream closed");
        })
        .map_err(|e| DeviceError::Io(format!("cannot start audio thread: {}", e)))?;

    Ok((ready_rx, stop_tx))
}

fn find_device(
    devices: Result<impl Iterator<Item = Device>, cpal::DevicesError>,
    default: Option<Device>,
    name: Option<&str>,
    kind: &str,
) -> Result<Device, DeviceError> {
    match name {
        None => default.ok_or_else(|| DeviceError::Unavailable(format!("no default {} device", kind))),
        Some(name) => devices
            .map_err(|e| DeviceError::Unavailable(format!("cannot list {} devices: {}", kind, e)))?
            .find(|device| device.name().ok().as_deref() == Some(name))
            .ok_or_else(|| DeviceError::Unavailable(format!("no {} device named '{}'", kind, name))),
    }
}

fn stream_error(kind: &str, err: cpal::BuildStreamError) -> DeviceError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => DeviceError::Unavailable(format!("{} device went away", kind)),
        other => DeviceError::Io(format!("cannot open {} stream: {}", kind, other)),
    }
}

// ## Capture

fn open_input(
    name: Option<&str>,
    block_size: usize,
    blocks: mpsc::Sender<Vec<f32>>,
) -> Result<(Stream, u32), DeviceError> {
    let host = cpal::default_host();
    let device = find_device(host.input_devices(), host.default_input_device(), name, "capture")?;
    let supported = device
        .default_input_config()
        .map_err(|e| DeviceError::Unavailable(format!("capture device has no usable format: {}", e)))?;

    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let assembler = BlockAssembler::new(channels as usize, block_size, blocks);

    let stream = match format {
        SampleFormat::F32 => build_input::<f32>(&device, &config, assembler),
        SampleFormat::I16 => build_input::<i16>(&device, &config, assembler),
        SampleFormat::I32 => build_input::<i32>(&device, &config, assembler),
        SampleFormat::U16 => build_input::<u16>(&device, &config, assembler),
        other => {
            return Err(DeviceError::Unavailable(format!(
                "unsupported capture sample format {:?}",
                other
            )))
        }
    }
    .map_err(|e| stream_error("capture", e))?;

    stream
        .play()
        .map_err(|e| DeviceError::Io(format!("cannot start capture: {}", e)))?;

    info!(
        device = %device.name().unwrap_or_default(),
        sample_rate,
        channels,
        format = ?format,
        block_size,
        "Microphone acquired"
    );
    Ok((stream, sample_rate))
}

fn build_input<T>(device: &Device, config: &StreamConfig, mut assembler: BlockAssembler) -> Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut converted = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            converted.clear();
            converted.extend(data.iter().map(|&sample| f32::from_sample(sample)));
            assembler.push(&converted);
        },
        |err| error!(%err, "Capture stream error"),
        None,
    )
}

/// Cuts interleaved callback buffers into fixed-size mono blocks.
struct BlockAssembler {
    channels: usize,
    block_size: usize,
    block: Vec<f32>,
    blocks: mpsc::Sender<Vec<f32>>,
    overruns: u64,
}

impl BlockAssembler {
    fn new(channels: usize, block_size: usize, blocks: mpsc::Sender<Vec<f32>>) -> Self {
        Self {
            channels: channels.max(1),
            block_size,
            block: Vec::with_capacity(block_size),
            blocks,
            overruns: 0,
        }
    }

    fn push(&mut self, interleaved: &[f32]) {
        for sample in downmix(interleaved, self.channels) {
            self.block.push(sample);
            if self.block.len() < self.block_size {
                continue;
            }

            let full = std::mem::replace(&mut self.block, Vec::with_capacity(self.block_size));
            match self.blocks.try_send(full) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => self.overruns += 1,
                // Session is gone; the stream is about to be dropped
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }
}

impl Drop for BlockAssembler {
    fn drop(&mut self) {
        if self.overruns > 0 {
            warn!(overruns = self.overruns, "Capture blocks dropped while the session was behind");
        }
    }
}

pub struct SystemInput {
    sample_rate: u32,
    blocks: mpsc::Receiver<Vec<f32>>,
    stop: Option<std_mpsc::Sender<()>>,
}

#[async_trait]
impl AudioInput for SystemInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn read_chunk(&mut self) -> Option<Vec<f32>> {
        if self.is_released() {
            return None;
        }
        self.blocks.recv().await
    }

    fn release(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
            self.blocks.close();
            debug!("Microphone released");
        }
    }

    fn is_released(&self) -> bool {
        self.stop.is_none()
    }
}

impl Drop for SystemInput {
    fn drop(&mut self) {
        self.release();
    }
}

// ## Playback

/// Playback position shared between the output callback and the session.
struct OutputTimeline {
    mixer: Mixer,
    played: u64,
    completions: CompletionSender,
}

impl OutputTimeline {
    /// Fill one callback's worth of mono frames and advance the clock.
    fn render(&mut self, out: &mut [f32]) {
        self.mixer.mix(self.played, out);
        self.played += out.len() as u64;
        for id in self.mixer.retire(self.played) {
            let _ = self.completions.send(id);
        }
    }
}

/// A poisoned lock only means a callback panicked mid-render; the timeline
/// itself is still consistent.
fn lock(timeline: &Mutex<OutputTimeline>) -> MutexGuard<'_, OutputTimeline> {
    timeline.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The device's own format when it can run at `preferred_rate` in f32,
/// otherwise its default format.
fn output_config(device: &Device, preferred_rate: u32) -> Result<SupportedStreamConfig, DeviceError> {
    let preferred = device.supported_output_configs().ok().and_then(|mut ranges| {
        ranges
            .find(|range| {
                range.sample_format() == SampleFormat::F32
                    && range.min_sample_rate().0 <= preferred_rate
                    && preferred_rate <= range.max_sample_rate().0
            })
            .map(|range| range.with_sample_rate(cpal::SampleRate(preferred_rate)))
    });

    match preferred {
        Some(config) => Ok(config),
        None => device
            .default_output_config()
            .map_err(|e| DeviceError::Unavailable(format!("playback device has no usable format: {}", e))),
    }
}

type SharedTimeline = Arc<Mutex<OutputTimeline>>;

fn open_output(
    name: Option<&str>,
    preferred_rate: u32,
    completions: CompletionSender,
) -> Result<(Stream, (SharedTimeline, u32)), DeviceError> {
    let host = cpal::default_host();
    let device = find_device(host.output_devices(), host.default_output_device(), name, "playback")?;
    let supported = output_config(&device, preferred_rate)?;

    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();

    let timeline = Arc::new(Mutex::new(OutputTimeline {
        mixer: Mixer::new(sample_rate),
        played: 0,
        completions,
    }));

    let stream = match format {
        SampleFormat::F32 => build_output::<f32>(&device, &config, timeline.clone()),
        SampleFormat::I16 => build_output::<i16>(&device, &config, timeline.clone()),
        SampleFormat::I32 => build_output::<i32>(&device, &config, timeline.clone()),
        SampleFormat::U16 => build_output::<u16>(&device, &config, timeline.clone()),
        other => {
            return Err(DeviceError::Unavailable(format!(
                "unsupported playback sample format {:?}",
                other
            )))
        }
    }
    .map_err(|e| stream_error("playback", e))?;

    stream
        .play()
        .map_err(|e| DeviceError::Io(format!("cannot start playback: {}", e)))?;

    info!(
        device = %device.name().unwrap_or_default(),
        sample_rate,
        requested_rate = preferred_rate,
        channels,
        format = ?format,
        "Speaker acquired"
    );
    Ok((stream, (timeline, sample_rate)))
}

fn build_output<T>(device: &Device, config: &StreamConfig, timeline: SharedTimeline) -> Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono = Vec::new();

    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            mono.resize(data.len() / channels, 0.0);
            lock(&timeline).render(&mut mono);

            for (frame, &sample) in data.chunks_mut(channels).zip(mono.iter()) {
                let value = T::from_sample(sample);
                frame.fill(value);
            }
        },
        |err| error!(%err, "Playback stream error"),
        None,
    )
}

pub struct SystemOutput {
    timeline: SharedTimeline,
    rate: u32,
    stop: Option<std_mpsc::Sender<()>>,
}

impl AudioOutput for SystemOutput {
    fn current_time(&self) -> f64 {
        lock(&self.timeline).played as f64 / self.rate as f64
    }

    fn schedule(&mut self, buffer: PlaybackBuffer, start: f64, id: u64) -> Result<(), DeviceError> {
        if self.is_released() {
            return Err(DeviceError::Released);
        }

        // Resample before taking the lock the callback needs
        let samples = prepare_segment(&buffer, self.rate).map_err(|e| DeviceError::Io(e.to_string()))?;
        lock(&self.timeline).mixer.insert(samples, start, id);
        Ok(())
    }

    fn release(&mut self) {
        let Some(stop) = self.stop.take() else {
            return;
        };

        let cancelled = {
            let mut timeline = lock(&self.timeline);
            let played = timeline.played;
            let cancelled = timeline.mixer.discard_unstarted(played);
            timeline.mixer.clear();
            cancelled
        };
        let _ = stop.send(());
        debug!(cancelled, "Speaker released");
    }

    fn is_released(&self) -> bool {
        self.stop.is_none()
    }
}

impl Drop for SystemOutput {
    fn drop(&mut self) {
        self.release();
    }
}
