//! # Session Lifecycle
//!
//! One conversation with the remote engine: acquire devices, open the channel,
//! stream audio both ways, tear everything down.
//!
//! ## Layout:
//! - **machine**: pure `(state, event) -> (state, effects)` transition function
//! - **driver**: the single tokio task that owns every handle and executes effects
//! - **controller**: the process-wide single session slot used by the HTTP surface
//!
//! ## Observing a session:
//! A session publishes [`SessionSignals`] over a `tokio::sync::watch` channel every
//! time something visible changes. Observers never touch the session's handles.

pub mod controller;
pub mod driver;
pub mod machine;

#[cfg(test)]
pub mod testing;

use crate::audio::capture::CaptureStats;
use crate::audio::device::DeviceError;
use crate::audio::scheduler::DrainPolicy;
use crate::config::AppConfig;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use controller::SessionController;
pub use machine::SessionState;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("could not acquire audio device: {0}")]
    DeviceAcquisition(DeviceError),

    #[error("could not open channel: {0}")]
    ChannelOpen(String),

    #[error("channel failed: {0}")]
    ChannelRuntime(String),

    #[error("channel close failed: {0}")]
    ChannelClose(String),

    #[error("audio device lost: {0}")]
    DeviceLost(String),

    #[error("{step} timed out after {after_ms} ms")]
    Timeout { step: String, after_ms: u64 },

    #[error("a session is already active")]
    AlreadyActive,
}

impl From<DeviceError> for SessionError {
    fn from(err: DeviceError) -> Self {
        SessionError::DeviceAcquisition(err)
    }
}

/// What the presentation layer sees of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSignals {
    pub session_id: Option<Uuid>,
    pub state: SessionState,
    /// Channel acknowledged and session active
    pub connected: bool,
    /// Scheduled playback has not drained yet
    pub ai_speaking: bool,
    /// Input activity level in [0, 1]
    pub volume: f32,
    /// Last user-visible failure. Kept after the session returns to idle.
    pub error: Option<String>,
}

impl Default for SessionSignals {
    fn default() -> Self {
        Self {
            session_id: None,
            state: SessionState::Idle,
            connected: false,
            ai_speaking: false,
            volume: 0.0,
            error: None,
        }
    }
}

/// Per-session settings, resolved from [`AppConfig`] when the session starts.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub capture_block_size: usize,
    pub volume_tick: Duration,
    pub fft_size: usize,
    pub drain_policy: DrainPolicy,
    pub drain_epsilon: f64,
    pub begin_message: String,
    pub device_acquire_timeout: Duration,
    pub channel_open_timeout: Duration,
    /// Bound on one outbound send before the channel is treated as failed
    pub send_timeout: Duration,
}

impl From<&AppConfig> for SessionConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            input_sample_rate: config.audio.input_sample_rate,
            output_sample_rate: config.audio.output_sample_rate,
            capture_block_size: config.audio.capture_block_size,
            volume_tick: Duration::from_millis(config.audio.volume_tick_ms),
            fft_size: config.audio.fft_size,
            drain_policy: config.audio.drain_policy,
            drain_epsilon: config.audio.drain_epsilon_secs,
            begin_message: config.remote.begin_message.clone(),
            device_acquire_timeout: config.timeouts.device_acquire(),
            channel_open_timeout: config.timeouts.channel_open(),
            send_timeout: config.timeouts.send(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Counters shared by every session the process runs.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    started: AtomicU64,
    failed: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    bytes_sent: AtomicU64,
    segments_scheduled: AtomicU64,
    decode_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionMetricsSnapshot {
    pub started: u64,
    pub failed: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub bytes_sent: u64,
    pub segments_scheduled: u64,
    pub decode_errors: u64,
}

impl SessionMetrics {
    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture(&self, stats: CaptureStats) {
        self.frames_sent.fetch_add(stats.frames_sent, Ordering::Relaxed);
        self.frames_dropped.fetch_add(stats.frames_dropped, Ordering::Relaxed);
        self.bytes_sent.fetch_add(stats.bytes_sent, Ordering::Relaxed);
    }

    pub fn record_segment(&self) {
        self.segments_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionMetricsSnapshot {
        SessionMetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            segments_scheduled: self.segments_scheduled.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}
