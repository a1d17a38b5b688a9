//! In-memory devices and channel for exercising sessions without I/O.

use crate::audio::device::{AudioInput, AudioOutput, CompletionSender, DeviceError, DeviceProvider};
use crate::audio::pcm::{AudioFrame, PlaybackBuffer};
use crate::remote::{ChannelConnector, ChannelError, ChannelEvent, ChannelEventSender, RemoteChannel};
use crate::session::{SessionSignals, SessionState};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// Poll `condition`, yielding to other tasks between checks.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition was never reached");
}

pub async fn wait_for_state(signals: &mut watch::Receiver<SessionSignals>, state: SessionState) -> SessionSignals {
    let current = signals
        .wait_for(|s| s.state == state)
        .await
        .expect("session ended before reaching the expected state");
    current.clone()
}

/// Everything a [`RecordingChannel`] was asked to do.
#[derive(Debug, Clone, Default)]
pub struct ChannelLog {
    pub frames: Vec<AudioFrame>,
    pub texts: Vec<String>,
    /// Sends that were accepted and then never completed
    pub stalled_sends: usize,
    pub closed: bool,
}

pub struct RecordingChannel {
    open: Arc<AtomicBool>,
    log: Arc<Mutex<ChannelLog>>,
    fail_close: bool,
    stall_sends: bool,
}

impl RecordingChannel {
    /// Park the caller forever, like a peer that stopped reading.
    async fn stall(&self) {
        self.log.lock().unwrap().stalled_sends += 1;
        std::future::pending::<()>().await;
    }
}

#[async_trait]
impl RemoteChannel for RecordingChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_audio_frame(&mut self, frame: &AudioFrame) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        if self.stall_sends {
            self.stall().await;
        }
        self.log.lock().unwrap().frames.push(frame.clone());
        Ok(())
    }

    async fn send_text(&mut self, text: &str) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        if self.stall_sends {
            self.stall().await;
        }
        self.log.lock().unwrap().texts.push(text.to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.open.store(false, Ordering::SeqCst);
        self.log.lock().unwrap().closed = true;
        if self.fail_close {
            return Err(ChannelError::Close("scripted close failure".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectBehavior {
    /// Connect and acknowledge right away
    Acknowledge,
    /// Connect but never acknowledge
    Silent,
    Refuse(String),
}

/// Hands out [`RecordingChannel`]s and lets tests inject channel events.
pub struct ScriptedConnector {
    behavior: ConnectBehavior,
    open: Arc<AtomicBool>,
    log: Arc<Mutex<ChannelLog>>,
    events: Mutex<Option<ChannelEventSender>>,
    connects: AtomicUsize,
    fail_close: AtomicBool,
    stall_sends: AtomicBool,
}

impl ScriptedConnector {
    fn with_behavior(behavior: ConnectBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            open: Arc::new(AtomicBool::new(false)),
            log: Arc::new(Mutex::new(ChannelLog::default())),
            events: Mutex::new(None),
            connects: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
            stall_sends: AtomicBool::new(false),
        })
    }

    pub fn acknowledging() -> Arc<Self> {
        Self::with_behavior(ConnectBehavior::Acknowledge)
    }

    pub fn silent() -> Arc<Self> {
        Self::with_behavior(ConnectBehavior::Silent)
    }

    pub fn refusing(reason: &str) -> Arc<Self> {
        Self::with_behavior(ConnectBehavior::Refuse(reason.to_string()))
    }

    pub fn with_failing_close(self: Arc<Self>) -> Arc<Self> {
        self.fail_close.store(true, Ordering::SeqCst);
        self
    }

    /// Channels accept sends and never finish them.
    pub fn with_stalled_sends(self: Arc<Self>) -> Arc<Self> {
        self.stall_sends.store(true, Ordering::SeqCst);
        self
    }

    /// Push an event into the connected session's queue.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        match self.events.lock().unwrap().as_ref() {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    pub fn log(&self) -> ChannelLog {
        self.log.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelConnector for ScriptedConnector {
    async fn connect(&self, events: ChannelEventSender) -> Result<Box<dyn RemoteChannel>, ChannelError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let ConnectBehavior::Refuse(reason) = &self.behavior {
            return Err(ChannelError::Open(reason.clone()));
        }

        let acknowledge = self.behavior == ConnectBehavior::Acknowledge;
        self.open.store(acknowledge, Ordering::SeqCst);
        if acknowledge {
            let _ = events.send(ChannelEvent::Opened);
        }
        *self.events.lock().unwrap() = Some(events);

        Ok(Box::new(RecordingChannel {
            open: self.open.clone(),
            log: self.log.clone(),
            fail_close: self.fail_close.load(Ordering::SeqCst),
            stall_sends: self.stall_sends.load(Ordering::SeqCst),
        }))
    }
}

/// Where one segment was placed on a [`ManualOutput`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledEntry {
    pub id: u64,
    pub start: f64,
    pub duration: f64,
}

/// Output device whose clock only moves when a test moves it.
///
/// Clones share state, so a test can keep one clone while the session owns another.
#[derive(Clone, Default)]
pub struct ManualOutput {
    time: Arc<Mutex<f64>>,
    scheduled: Arc<Mutex<Vec<ScheduledEntry>>>,
    completions: Arc<Mutex<Option<CompletionSender>>>,
    acquired: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
}

impl ManualOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_time(&self, seconds: f64) {
        *self.time.lock().unwrap() = seconds;
    }

    pub fn scheduled(&self) -> Vec<ScheduledEntry> {
        self.scheduled.lock().unwrap().clone()
    }

    /// Report the end of segment `id` to whoever acquired this device.
    pub fn complete(&self, id: u64) {
        if let Some(completions) = self.completions.lock().unwrap().as_ref() {
            let _ = completions.send(id);
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::SeqCst)
    }
}

impl AudioOutput for ManualOutput {
    fn current_time(&self) -> f64 {
        *self.time.lock().unwrap()
    }

    fn schedule(&mut self, buffer: PlaybackBuffer, start: f64, id: u64) -> Result<(), DeviceError> {
        if self.is_released() {
            return Err(DeviceError::Released);
        }
        self.scheduled.lock().unwrap().push(ScheduledEntry {
            id,
            start,
            duration: buffer.duration(),
        });
        Ok(())
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Capture device fed block by block from the test.
pub struct ScriptedInput {
    blocks: mpsc::UnboundedReceiver<Vec<f32>>,
    released: Arc<AtomicBool>,
}

#[async_trait]
impl AudioInput for ScriptedInput {
    fn sample_rate(&self) -> u32 {
        16000
    }

    async fn read_chunk(&mut self) -> Option<Vec<f32>> {
        if self.is_released() {
            return None;
        }
        self.blocks.recv().await
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

pub struct ScriptedDevices {
    output: ManualOutput,
    input_feed: Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>,
    input_blocks: Mutex<Option<mpsc::UnboundedReceiver<Vec<f32>>>>,
    input_acquired: AtomicBool,
    input_released: Arc<AtomicBool>,
    input_failure: Option<DeviceError>,
    output_failure: Option<DeviceError>,
    hang_input: bool,
}

impl ScriptedDevices {
    pub fn new() -> Self {
        let (feed, blocks) = mpsc::unbounded_channel();
        Self {
            output: ManualOutput::new(),
            input_feed: Mutex::new(Some(feed)),
            input_blocks: Mutex::new(Some(blocks)),
            input_acquired: AtomicBool::new(false),
            input_released: Arc::new(AtomicBool::new(false)),
            input_failure: None,
            output_failure: None,
            hang_input: false,
        }
    }

    pub fn failing_input(mut self, err: DeviceError) -> Self {
        self.input_failure = Some(err);
        self
    }

    pub fn failing_output(mut self, err: DeviceError) -> Self {
        self.output_failure = Some(err);
        self
    }

    /// Input acquisition never completes, like a permission prompt left open.
    pub fn hanging_input(mut self) -> Self {
        self.hang_input = true;
        self
    }

    pub fn output(&self) -> &ManualOutput {
        &self.output
    }

    /// Deliver one captured block.
    pub fn feed(&self, block: Vec<f32>) -> bool {
        match self.input_feed.lock().unwrap().as_ref() {
            Some(feed) => feed.send(block).is_ok(),
            None => false,
        }
    }

    /// End the capture stream, as if the microphone went away.
    pub fn end_input(&self) {
        self.input_feed.lock().unwrap().take();
    }

    pub fn input_acquired(&self) -> bool {
        self.input_acquired.load(Ordering::SeqCst)
    }

    /// True when the input was never handed out or has been given back.
    pub fn input_released(&self) -> bool {
        !self.input_acquired() || self.input_released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceProvider for ScriptedDevices {
    async fn acquire_input(&self, _block_size: usize) -> Result<Box<dyn AudioInput>, DeviceError> {
        if self.hang_input {
            std::future::pending::<()>().await;
        }
        if let Some(err) = &self.input_failure {
            return Err(err.clone());
        }

        let blocks = self
            .input_blocks
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| DeviceError::Unavailable("capture device busy".to_string()))?;
        self.input_acquired.store(true, Ordering::SeqCst);

        Ok(Box::new(ScriptedInput {
            blocks,
            released: self.input_released.clone(),
        }))
    }

    async fn acquire_output(
        &self,
        _sample_rate: u32,
        completions: CompletionSender,
    ) -> Result<Box<dyn AudioOutput>, DeviceError> {
        if let Some(err) = &self.output_failure {
            return Err(err.clone());
        }

        *self.output.completions.lock().unwrap() = Some(completions);
        self.output.acquired.store(true, Ordering::SeqCst);
        Ok(Box::new(self.output.clone()))
    }
}
