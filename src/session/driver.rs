//! # Session Driver
//!
//! One tokio task per session. The task exclusively owns the input device, the
//! output device and the channel, feeds every callback-style notification into
//! the pure state machine, and executes the effects it returns.
//!
//! ## Event Sources (multiplexed with `tokio::select!`):
//! - **commands**: start/stop requests from the [`SessionHandle`]
//! - **channel events**: open acknowledgment, inbound audio, close, transport errors
//! - **playback completions**: segment ids reported by the output device
//! - **capture blocks**: microphone blocks while capture runs
//! - **meter ticks**: volume recomputation while metering runs
//! - **open deadline**: bound on waiting for the channel acknowledgment
//!
//! ## Startup:
//! Device acquisition and channel connect race against stop commands, each under
//! its configured timeout. A stop that lands mid-step abandons the step and the
//! cleanup that follows releases whatever was already acquired.
//!
//! ## Outbound sends:
//! Every send (the begin text and each audio frame) runs under the same race,
//! bounded by the send timeout. A peer that stops reading cannot wedge the task:
//! a stop still lands, and a send that outlives its bound fails the session.
//!
//! ## Cleanup Order:
//! 1. Close the channel (best effort, bounded by `CLOSE_TIMEOUT`)
//! 2. Stop the capture pipeline and record its counters
//! 3. Release the input, then the output device
//! 4. Reset meter, analyser, scheduler and the open deadline
//!
//! ## Rust Concepts:
//! - **`biased;` in `select!`**: commands are polled first, so a stop is never
//!   starved by a busy capture stream
//! - **`Option::take()`**: the channel is moved out of `self` for the duration of
//!   a send, which lets the send future and `race(&mut self)` coexist
//! - **`if` guards on `select!` branches**: capture and meter branches only
//!   exist while those features run

use crate::audio::analyser::SpectrumAnalyser;
use crate::audio::capture::{CaptureOutcome, CapturePipeline};
use crate::audio::device::{AudioInput, AudioOutput, DeviceProvider};
use crate::audio::meter::VolumeMeter;
use crate::audio::pcm;
use crate::audio::scheduler::PlaybackScheduler;
use crate::remote::{ChannelConnector, ChannelError, ChannelEvent, ChannelEventSender, InlineAudio, RemoteChannel};
use crate::session::machine::{transition, Effect, Observation, SessionEvent, SessionState, Transition};
use crate::session::{SessionConfig, SessionError, SessionMetrics, SessionSignals};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Upper bound on the best-effort channel close during cleanup.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// External collaborators a session runs against.
#[derive(Clone)]
pub struct SessionDeps {
    pub devices: Arc<dyn DeviceProvider>,
    pub connector: Arc<dyn ChannelConnector>,
    pub metrics: Arc<SessionMetrics>,
}

enum Command {
    Start(oneshot::Sender<Result<(), SessionError>>),
    Stop,
}

pub struct Session;

impl Session {
    /// Spawn the driver task and begin connecting immediately.
    pub fn start(config: SessionConfig, deps: SessionDeps) -> SessionHandle {
        let id = Uuid::new_v4();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        // Start from Idle is always accepted, so observers see Connecting right away
        let (signals_tx, signals_rx) = watch::channel(SessionSignals {
            session_id: Some(id),
            state: SessionState::Connecting,
            ..SessionSignals::default()
        });

        let driver = Driver::new(id, config, deps, command_rx, signals_tx);
        let task = tokio::spawn(driver.run().instrument(info_span!("session", %id)));

        SessionHandle {
            id,
            commands: command_tx,
            signals: signals_rx,
            task,
        }
    }
}

/// The single owner of a running session.
///
/// Dropping the handle closes the command queue, which the driver treats as a
/// stop request.
pub struct SessionHandle {
    id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    signals: watch::Receiver<SessionSignals>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn signals(&self) -> SessionSignals {
        self.signals.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSignals> {
        self.signals.clone()
    }

    /// True once the driver has cleaned up and exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the running session whether a new start may proceed.
    ///
    /// `Err(AlreadyActive)` while the session is live. `Ok` once it has ended.
    pub async fn request_start(&self) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Start(reply_tx)).is_err() {
            return Ok(());
        }
        reply_rx.await.unwrap_or(Ok(()))
    }

    /// Stop the session and wait for cleanup to finish.
    pub async fn stop(self) -> SessionSignals {
        let _ = self.commands.send(Command::Stop);
        self.join().await
    }

    /// Wait for the session to end on its own.
    pub async fn join(self) -> SessionSignals {
        if let Err(e) = self.task.await {
            error!(session_id = %self.id, error = %e, "Session task ended abnormally");
        }
        let signals = self.signals.borrow().clone();
        signals
    }
}

/// Outcome of a step raced against its bound and against stop commands.
enum Raced<T> {
    Done(T),
    TimedOut,
    Stopped, // step future dropped unfinished
}

struct Driver {
    id: Uuid,
    config: SessionConfig,
    devices: Arc<dyn DeviceProvider>,
    connector: Arc<dyn ChannelConnector>,
    metrics: Arc<SessionMetrics>,

    state: SessionState,
    pending: VecDeque<SessionEvent>, // events not yet fed to the machine
    error: Option<String>,           // first failure, kept through Idle

    input: Option<Box<dyn AudioInput>>,
    output: Option<Box<dyn AudioOutput>>,
    channel: Option<Box<dyn RemoteChannel>>,

    capture: CapturePipeline,
    scheduler: PlaybackScheduler,
    analyser: SpectrumAnalyser,
    meter: VolumeMeter,
    meter_ticker: Option<Interval>,
    open_deadline: Option<Instant>, // set on connect, cleared by cleanup

    commands: mpsc::UnboundedReceiver<Command>,
    channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    channel_events_tx: ChannelEventSender,
    completions: mpsc::UnboundedReceiver<u64>,
    completions_tx: mpsc::UnboundedSender<u64>,
    signals: watch::Sender<SessionSignals>,
}

impl Driver {
    fn new(
        id: Uuid,
        config: SessionConfig,
        deps: SessionDeps,
        commands: mpsc::UnboundedReceiver<Command>,
        signals: watch::Sender<SessionSignals>,
    ) -> Self {
        let (channel_events_tx, channel_events) = mpsc::unbounded_channel();
        let (completions_tx, completions) = mpsc::unbounded_channel();

        Self {
            id,
            capture: CapturePipeline::new(config.input_sample_rate),
            scheduler: PlaybackScheduler::new(config.drain_policy, config.drain_epsilon),
            analyser: SpectrumAnalyser::new(config.fft_size),
            meter: VolumeMeter::new(),
            config,
            devices: deps.devices,
            connector: deps.connector,
            metrics: deps.metrics,
            state: SessionState::Idle,
            pending: VecDeque::new(),
            error: None,
            input: None,
            output: None,
            channel: None,
            meter_ticker: None,
            open_deadline: None,
            commands,
            channel_events,
            channel_events_tx,
            completions,
            completions_tx,
            signals,
        }
    }

    async fn run(mut self) {
        info!("Session starting");
        self.metrics.record_started();
        self.pending.push_back(SessionEvent::StartRequested);
        self.drain().await;

        while self.state != SessionState::Idle {
            let capturing = self.capture.is_running();
            let metering = self.meter_ticker.is_some();
            let awaiting_ack = self.state == SessionState::Connecting && self.open_deadline.is_some();

            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Start(reply)) => self.answer_start(reply),
                    Some(Command::Stop) | None => self.pending.push_back(SessionEvent::StopRequested),
                },
                _ = wait_until(self.open_deadline), if awaiting_ack => {
                    let err = timeout_error("channel open", self.config.channel_open_timeout);
                    self.pending.push_back(SessionEvent::ChannelError(err));
                }
                Some(event) = self.channel_events.recv() => self.on_channel_event(event),
                Some(id) = self.completions.recv() => self.on_playback_complete(id),
                chunk = next_chunk(self.input.as_mut()), if capturing => self.on_capture_chunk(chunk).await,
                _ = next_tick(self.meter_ticker.as_mut()), if metering => self.on_meter_tick(),
            }

            self.drain().await;
            self.publish();
        }

        self.publish();
        info!(error = ?self.error, "Session ended");
    }

    /// Feed queued events through the state machine until none are left.
    async fn drain(&mut self) {
        while let Some(event) = self.pending.pop_front() {
            let Transition { state, effects } = transition(self.state, &event);
            if state != self.state {
                info!(from = %self.state, to = %state, "Session state changed");
            }
            self.state = state;

            for effect in effects {
                self.execute(effect).await;
            }
            self.publish();
        }
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::AcquireResources => self.acquire_resources().await,
            Effect::SendBegin => self.send_begin().await,
            Effect::StartCapture => self.start_capture(),
            Effect::StartMeter => {
                let mut ticker = tokio::time::interval(self.config.volume_tick.max(Duration::from_millis(1)));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                self.meter_ticker = Some(ticker);
            }
            Effect::PlayAudio(audio) => self.play(audio),
            Effect::Observe(Observation::TurnComplete) => info!("Remote turn complete"),
            Effect::Observe(Observation::Interrupted) => info!("Remote turn interrupted"),
            Effect::ReportError(err) => {
                error!(error = %err, "Session failed");
                self.metrics.record_failed();
                self.error = Some(err.to_string());
            }
            Effect::Cleanup => self.cleanup().await,
            Effect::RejectStart => debug!("Start rejected, session already in progress"),
        }
    }

    /// Output first, then input, then the channel. The first failure stops the
    /// sequence; whatever was acquired is released by the cleanup that follows.
    async fn acquire_resources(&mut self) {
        let devices = self.devices.clone();
        let limit = self.config.device_acquire_timeout;

        let output = devices.acquire_output(self.config.output_sample_rate, self.completions_tx.clone());
        match self.race(limit, output).await {
            Raced::Done(Ok(output)) => {
                self.output = Some(output);
                self.scheduler.reset();
            }
            Raced::Done(Err(e)) => {
                self.pending.push_back(SessionEvent::AcquisitionFailed(e.into()));
                return;
            }
            Raced::TimedOut => {
                let err = timeout_error("playback device acquisition", limit);
                self.pending.push_back(SessionEvent::AcquisitionFailed(err));
                return;
            }
            Raced::Stopped => {
                self.pending.push_back(SessionEvent::StopRequested);
                return;
            }
        }

        let input = devices.acquire_input(self.config.capture_block_size);
        match self.race(limit, input).await {
            Raced::Done(Ok(input)) => self.input = Some(input),
            Raced::Done(Err(e)) => {
                self.pending.push_back(SessionEvent::AcquisitionFailed(e.into()));
                return;
            }
            Raced::TimedOut => {
                let err = timeout_error("capture device acquisition", limit);
                self.pending.push_back(SessionEvent::AcquisitionFailed(err));
                return;
            }
            Raced::Stopped => {
                self.pending.push_back(SessionEvent::StopRequested);
                return;
            }
        }

        // The open bound covers both the connect and the acknowledgment
        let connector = self.connector.clone();
        let limit = self.config.channel_open_timeout;
        self.open_deadline = Some(Instant::now() + limit);

        let connect = connector.connect(self.channel_events_tx.clone());
        match self.race(limit, connect).await {
            Raced::Done(Ok(channel)) => {
                debug!("Channel connected, waiting for acknowledgment");
                self.channel = Some(channel);
            }
            Raced::Done(Err(e)) => {
                let err = SessionError::ChannelOpen(e.to_string());
                self.pending.push_back(SessionEvent::ChannelError(err));
            }
            Raced::TimedOut => {
                let err = timeout_error("channel open", limit);
                self.pending.push_back(SessionEvent::ChannelError(err));
            }
            Raced::Stopped => self.pending.push_back(SessionEvent::StopRequested),
        }
    }

    /// Run one startup step under `limit` while staying responsive to commands.
    async fn race<F: Future>(&mut self, limit: Duration, step: F) -> Raced<F::Output> {
        let step = tokio::time::timeout(limit, step);
        tokio::pin!(step);

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Start(reply)) => self.answer_start(reply),
                    Some(Command::Stop) | None => {
                        debug!("Stop requested during startup, abandoning pending step");
                        return Raced::Stopped;
                    }
                },
                result = &mut step => {
                    return match result {
                        Ok(output) => Raced::Done(output),
                        Err(_) => Raced::TimedOut,
                    };
                }
            }
        }
    }

    /// Capture runs at the device's native rate and is resampled to the
    /// configured input rate inside the pipeline.
    fn start_capture(&mut self) {
        self.analyser.reset();
        let native_rate = self
            .input
            .as_ref()
            .map(|input| input.sample_rate())
            .unwrap_or(self.config.input_sample_rate);

        if let Err(e) = self.capture.start(native_rate) {
            self.pending
                .push_back(SessionEvent::DeviceLost(format!("capture format: {}", e)));
        }
    }

    async fn send_begin(&mut self) {
        if self.config.begin_message.is_empty() {
            return;
        }
        let Some(mut channel) = self.channel.take() else {
            return;
        };

        let text = self.config.begin_message.clone();
        let limit = self.config.send_timeout;
        let sent = self.race(limit, channel.send_text(&text)).await;
        self.channel = Some(channel);
        self.after_send(sent, "begin message");
    }

    /// Turn the outcome of a raced send into session events.
    ///
    /// Returns true only when the send went through.
    fn after_send(&mut self, sent: Raced<Result<(), ChannelError>>, what: &str) -> bool {
        match sent {
            Raced::Done(Ok(())) => true,
            Raced::Done(Err(e)) => {
                let err = SessionError::ChannelRuntime(e.to_string());
                self.pending.push_back(SessionEvent::ChannelError(err));
                false
            }
            Raced::TimedOut => {
                let err = SessionError::ChannelRuntime(format!(
                    "{} send stalled for {} ms",
                    what,
                    self.config.send_timeout.as_millis()
                ));
                self.pending.push_back(SessionEvent::ChannelError(err));
                false
            }
            Raced::Stopped => {
                self.pending.push_back(SessionEvent::StopRequested);
                false
            }
        }
    }

    /// Decode one inbound audio part and place it on the playback timeline.
    ///
    /// Undecodable audio is dropped here and never reaches the state machine.
    fn play(&mut self, audio: InlineAudio) {
        let rate = pcm::mime_sample_rate(&audio.mime_type).unwrap_or(self.config.output_sample_rate);
        let buffer = match pcm::decode_base64(&audio.data, rate, 1) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!(error = %e, mime_type = %audio.mime_type, "Dropping undecodable inbound audio");
                self.metrics.record_decode_error();
                return;
            }
        };

        let Some(output) = self.output.as_mut() else {
            warn!("No playback device, dropping inbound audio");
            return;
        };

        match self.scheduler.enqueue(&mut **output, buffer) {
            Ok(_) => self.metrics.record_segment(),
            Err(e) => {
                let reason = format!("playback device: {}", e);
                self.pending.push_back(SessionEvent::DeviceLost(reason));
            }
        }
    }

    /// Release everything. Each step runs regardless of how the others went.
    async fn cleanup(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, channel.close()).await {
                Ok(Ok(())) => debug!("Channel closed"),
                Ok(Err(e)) => {
                    let err = SessionError::ChannelClose(e.to_string());
                    warn!(error = %err, "Ignoring channel close failure");
                }
                Err(_) => warn!("Channel close timed out"),
            }
        }

        let stats = self.capture.stop();
        self.metrics.record_capture(stats);

        if let Some(mut input) = self.input.take() {
            input.release();
        }
        if let Some(mut output) = self.output.take() {
            output.release();
        }

        self.meter_ticker = None;
        self.meter.reset();
        self.analyser.reset();
        self.scheduler.reset();
        self.open_deadline = None;

        self.pending.push_back(SessionEvent::CleanupFinished);
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => self.pending.push_back(SessionEvent::ChannelOpened),
            ChannelEvent::Message(message) => {
                for text in &message.text {
                    debug!(text = %text, "Remote transcript");
                }
                for audio in message.audio {
                    self.pending.push_back(SessionEvent::InboundAudio(audio));
                }
                if message.interrupted {
                    self.pending.push_back(SessionEvent::Interrupted);
                }
                if message.turn_complete {
                    self.pending.push_back(SessionEvent::TurnComplete);
                }
            }
            ChannelEvent::Closed { reason } => self.pending.push_back(SessionEvent::ChannelClosed { reason }),
            ChannelEvent::Error(message) => {
                let err = if self.state == SessionState::Connecting {
                    SessionError::ChannelOpen(message)
                } else {
                    SessionError::ChannelRuntime(message)
                };
                self.pending.push_back(SessionEvent::ChannelError(err));
            }
        }
    }

    // Completion ids are informational; the scheduler counts, it does not match ids
    fn on_playback_complete(&mut self, id: u64) {
        let Some(output) = self.output.as_ref() else {
            return;
        };
        let now = output.current_time();
        let audible = self.scheduler.on_complete(now);
        debug!(id, now, audible, "Segment finished");
    }

    /// One microphone block: analyse, frame, and send if the channel is open.
    ///
    /// `None` means the input stream ended, which is a device loss.
    async fn on_capture_chunk(&mut self, chunk: Option<Vec<f32>>) {
        let Some(block) = chunk else {
            self.pending
                .push_back(SessionEvent::DeviceLost("capture stream ended".to_string()));
            return;
        };

        let open = self.channel.as_ref().map_or(false, |channel| channel.is_open());
        let frame = match self.capture.prepare(&block, &mut self.analyser, open) {
            CaptureOutcome::Ready(frame) => frame,
            CaptureOutcome::Buffered | CaptureOutcome::Dropped => return,
        };
        let Some(mut channel) = self.channel.take() else {
            return;
        };

        let limit = self.config.send_timeout;
        let sent = self.race(limit, channel.send_audio_frame(&frame)).await;
        self.channel = Some(channel);
        if self.after_send(sent, "audio") {
            self.capture.record_sent(&frame);
        }
    }

    fn on_meter_tick(&mut self) {
        let bins = self.analyser.byte_frequency_data();
        self.meter.sample(&bins);
    }

    /// Answer a start request that reached a session already in progress.
    fn answer_start(&self, reply: oneshot::Sender<Result<(), SessionError>>) {
        let Transition { effects, .. } = transition(self.state, &SessionEvent::StartRequested);
        let result = if effects.contains(&Effect::RejectStart) {
            warn!(state = %self.state, "Rejecting start, a session is already in progress");
            Err(SessionError::AlreadyActive)
        } else {
            Ok(())
        };
        let _ = reply.send(result);
    }

    fn publish(&self) {
        let snapshot = SessionSignals {
            session_id: Some(self.id),
            state: self.state,
            connected: self.state == SessionState::Active
                && self.channel.as_ref().map_or(false, |channel| channel.is_open()),
            ai_speaking: self.scheduler.is_audible(),
            volume: self.meter.current(),
            error: self.error.clone(),
        };

        self.signals.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

fn timeout_error(step: &str, limit: Duration) -> SessionError {
    SessionError::Timeout {
        step: step.to_string(),
        after_ms: limit.as_millis() as u64,
    }
}

/// Never resolves without an input, so the `select!` branch stays quiet.
async fn next_chunk(input: Option<&mut Box<dyn AudioInput>>) -> Option<Vec<f32>> {
    match input {
        Some(input) => input.read_chunk().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::DeviceError;
    use crate::remote::InboundMessage;
    use crate::session::testing::{eventually, wait_for_state, ScriptedConnector, ScriptedDevices};

    fn deps(devices: &Arc<ScriptedDevices>, connector: &Arc<ScriptedConnector>) -> (SessionDeps, Arc<SessionMetrics>) {
        let metrics = Arc::new(SessionMetrics::default());
        let deps = SessionDeps {
            devices: devices.clone(),
            connector: connector.clone(),
            metrics: metrics.clone(),
        };
        (deps, metrics)
    }

    fn speech(seconds: f64) -> InlineAudio {
        let samples = vec![0.25; (seconds * 24000.0) as usize];
        InlineAudio {
            mime_type: "audio/pcm;rate=24000".to_string(),
            data: pcm::encode(&samples, 24000).unwrap().to_base64(),
        }
    }

    fn message_with(audio: Vec<InlineAudio>) -> ChannelEvent {
        ChannelEvent::Message(InboundMessage {
            audio,
            ..InboundMessage::default()
        })
    }

    async fn active_session(
        devices: &Arc<ScriptedDevices>,
        connector: &Arc<ScriptedConnector>,
    ) -> (SessionHandle, watch::Receiver<SessionSignals>, Arc<SessionMetrics>) {
        let (deps, metrics) = deps(devices, connector);
        let handle = Session::start(SessionConfig::default(), deps);
        let mut signals = handle.subscribe();
        wait_for_state(&mut signals, SessionState::Active).await;
        (handle, signals, metrics)
    }

    #[tokio::test]
    async fn test_acquisition_failure_returns_to_idle() {
        let devices = Arc::new(
            ScriptedDevices::new().failing_input(DeviceError::PermissionDenied("microphone".to_string())),
        );
        let connector = ScriptedConnector::acknowledging();
        let (deps, metrics) = deps(&devices, &connector);

        let signals = Session::start(SessionConfig::default(), deps).join().await;

        assert_eq!(signals.state, SessionState::Idle);
        assert!(!signals.connected);
        let error = signals.error.expect("error is reported");
        assert!(error.contains("permission denied"), "{}", error);

        assert!(devices.output().is_released());
        assert!(!devices.input_acquired());
        assert_eq!(connector.connects(), 0);
        assert_eq!(metrics.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_start_stream_and_stop() {
        let devices = Arc::new(ScriptedDevices::new());
        let connector = ScriptedConnector::acknowledging();
        let (handle, _signals, _metrics) = active_session(&devices, &connector).await;

        let signals = handle.signals();
        assert!(signals.connected);
        assert!(signals.error.is_none());
        eventually(|| connector.log().texts == vec!["Hello".to_string()]).await;

        let signals = handle.stop().await;
        assert_eq!(signals.state, SessionState::Idle);
        assert!(!signals.connected);
        assert!(!signals.ai_speaking);
        assert_eq!(signals.volume, 0.0);
        assert!(signals.error.is_none());

        assert!(connector.log().closed);
        assert!(devices.input_released());
        assert!(devices.output().is_released());
    }

    #[tokio::test]
    async fn test_capture_blocks_flow_to_channel() {
        let devices = Arc::new(ScriptedDevices::new());
        let connector = ScriptedConnector::acknowledging();
        let (handle, _signals, metrics) = active_session(&devices, &connector).await;

        assert!(devices.feed(vec![0.1; 4096]));
        assert!(devices.feed(vec![-0.1; 4096]));
        eventually(|| connector.log().frames.len() == 2).await;

        let frames = connector.log().frames;
        assert_eq!(frames[0].sample_count(), 4096);
        assert_eq!(frames[0].mime_type, "audio/pcm;rate=16000");

        handle.stop().await;
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_sent, 2);
        assert_eq!(snapshot.bytes_sent, 2 * 8192);
    }

    #[tokio::test]
    async fn test_decode_error_keeps_session_active() {
        let devices = Arc::new(ScriptedDevices::new());
        let connector = ScriptedConnector::acknowledging();
        let (handle, mut signals, metrics) = active_session(&devices, &connector).await;

        let broken = InlineAudio {
            mime_type: "audio/pcm;rate=24000".to_string(),
            data: "%%% not base64 %%%".to_string(),
        };
        assert!(connector.emit(message_with(vec![broken])));
        assert!(connector.emit(message_with(vec![speech(0.5)])));

        let current = signals.wait_for(|s| s.ai_speaking).await.unwrap().clone();
        assert_eq!(current.state, SessionState::Active);
        assert!(current.error.is_none());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.decode_errors, 1);
        assert_eq!(snapshot.segments_scheduled, 1);
        assert_eq!(devices.output().scheduled().len(), 1);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_playback_is_gapless_and_drains() {
        let devices = Arc::new(ScriptedDevices::new());
        let connector = ScriptedConnector::acknowledging();
        let (handle, mut signals, _metrics) = active_session(&devices, &connector).await;

        assert!(connector.emit(message_with(vec![speech(1.0), speech(1.0)])));
        eventually(|| devices.output().scheduled().len() == 2).await;

        let scheduled = devices.output().scheduled();
        assert_eq!(scheduled[0].start, 0.0);
        assert_eq!(scheduled[1].start, 1.0);

        devices.output().set_time(1.0);
        devices.output().complete(scheduled[0].id);
        devices.output().set_time(2.0);
        devices.output().complete(scheduled[1].id);

        signals.wait_for(|s| !s.ai_speaking).await.unwrap();
        assert_eq!(handle.signals().state, SessionState::Active);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_without_disturbing_session() {
        let devices = Arc::new(ScriptedDevices::new());
        let connector = ScriptedConnector::acknowledging();
        let (handle, _signals, _metrics) = active_session(&devices, &connector).await;

        assert_eq!(handle.request_start().await, Err(SessionError::AlreadyActive));
        assert_eq!(handle.signals().state, SessionState::Active);
        assert!(handle.signals().connected);

        let signals = handle.stop().await;
        assert_eq!(signals.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_stop_during_connecting_releases_partial_devices() {
        let devices = Arc::new(ScriptedDevices::new().hanging_input());
        let connector = ScriptedConnector::acknowledging();
        let (deps, _metrics) = deps(&devices, &connector);

        let handle = Session::start(SessionConfig::default(), deps);
        eventually(|| devices.output().is_acquired()).await;
        assert_eq!(handle.signals().state, SessionState::Connecting);

        let signals = handle.stop().await;
        assert_eq!(signals.state, SessionState::Idle);
        assert!(signals.error.is_none());
        assert!(devices.output().is_released());
        assert!(!devices.input_acquired());
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_acknowledgment_times_out() {
        let devices = Arc::new(ScriptedDevices::new());
        let connector = ScriptedConnector::silent();
        let (deps, _metrics) = deps(&devices, &connector);

        let config = SessionConfig {
            channel_open_timeout: Duration::from_millis(500),
            ..SessionConfig::default()
        };
        let signals = Session::start(config, deps).join().await;

        assert_eq!(signals.state, SessionState::Idle);
        let error = signals.error.expect("timeout is reported");
        assert!(error.contains("timed out"), "{}", error);
        assert!(connector.log().closed);
        assert!(devices.input_released());
    }

    #[tokio::test]
    async fn test_refused_connection_fails_session() {
        let devices = Arc::new(ScriptedDevices::new());
        let connector = ScriptedConnector::refusing("401 unauthorized");
        let (deps, _metrics) = deps(&devices, &connector);

        let signals = Session::start(SessionConfig::default(), deps).join().await;

        assert_eq!(signals.state, SessionState::Idle);
        assert!(signals.error.unwrap().contains("401 unauthorized"));
        assert!(devices.input_released());
        assert!(devices.output().is_released());
    }

    #[tokio::test]
    async fn test_remote_close_ends_session_quietly() {
        let devices = Arc::new(ScriptedDevices::new());
        let connector = ScriptedConnector::acknowledging();
        let (handle, _signals, _metrics) = active_session(&devices, &connector).await;

        assert!(connector.emit(ChannelEvent::Closed { reason: None }));
        let signals = handle.join().await;

        assert_eq!(signals.state, SessionState::Idle);
        assert!(signals.error.is_none());
        assert!(devices.input_released());
    }

    #[tokio::test]
    async fn test_channel_error_while_active_is_reported() {
        let devices = Arc::new(ScriptedDevices::new());
        let connector = ScriptedConnector::acknowledging();
        let (handle, _signals, _metrics) = active_session(&devices, &connector).await;

        assert!(connector.emit(ChannelEvent::Error("connection reset".to_string())));
        let signals = handle.join().await;

        assert_eq!(signals.state, SessionState::Idle);
        assert!(signals.error.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_lost_capture_stream_fails_session() {
        let devices = Arc::new(ScriptedDevices::new());
        let connector = ScriptedConnector::acknowledging();
        let (handle, _signals, _metrics) = active_session(&devices, &connector).await;

        devices.end_input();
        let signals = handle.join().await;

        assert_eq!(signals.state, SessionState::Idle);
        assert!(signals.error.unwrap().contains("capture stream ended"));
        assert!(devices.output().is_released());
    }

    #[tokio::test]
    async fn test_stop_is_not_blocked_by_stalled_send() {
        let devices = Arc::new(ScriptedDevices::new());
        let connector = ScriptedConnector::acknowledging().with_stalled_sends();
        let (deps, _metrics) = deps(&devices, &connector);
        let config = SessionConfig {
            begin_message: String::new(),
            ..SessionConfig::default()
        };

        let handle = Session::start(config, deps);
        let mut signals = handle.subscribe();
        wait_for_state(&mut signals, SessionState::Active).await;

        assert!(devices.feed(vec![0.1; 4096]));
        eventually(|| connector.log().stalled_sends == 1).await;

        let signals = tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("stop completes while a send is stalled");
        assert_eq!(signals.state, SessionState::Idle);
        assert!(signals.error.is_none());
        assert!(connector.log().closed);
        assert!(devices.input_released());
        assert!(devices.output().is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_send_fails_session_after_bound() {
        let devices = Arc::new(ScriptedDevices::new());
        let connector = ScriptedConnector::acknowledging().with_stalled_sends();
        let (deps, metrics) = deps(&devices, &connector);
        let config = SessionConfig {
            send_timeout: Duration::from_millis(300),
            ..SessionConfig::default()
        };

        // The begin message is the first send and never completes
        let signals = Session::start(config, deps).join().await;

        assert_eq!(signals.state, SessionState::Idle);
        let error = signals.error.expect("stalled send is reported");
        assert!(error.contains("begin message send stalled for 300 ms"), "{}", error);
        assert_eq!(connector.log().stalled_sends, 1);
        assert!(devices.input_released());
        assert!(devices.output().is_released());
        assert_eq!(metrics.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_close_failure_does_not_surface() {
        let devices = Arc::new(ScriptedDevices::new());
        let connector = ScriptedConnector::acknowledging().with_failing_close();
        let (handle, _signals, _metrics) = active_session(&devices, &connector).await;

        let signals = handle.stop().await;
        assert_eq!(signals.state, SessionState::Idle);
        assert!(signals.error.is_none());
        assert!(devices.input_released());
        assert!(devices.output().is_released());
    }
}
