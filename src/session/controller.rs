//! # Session Controller
//!
//! The process-wide session slot. Exactly one session may be live at a time;
//! the controller holds its [`SessionHandle`] and mirrors its signals into a
//! watch channel that outlives individual sessions, so observers keep seeing
//! the last state (and the last error) after a session ends.

use crate::audio::device::DeviceProvider;
use crate::remote::ChannelConnector;
use crate::session::driver::{Session, SessionDeps, SessionHandle};
use crate::session::{SessionConfig, SessionError, SessionMetrics, SessionMetricsSnapshot, SessionSignals};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct LiveSession {
    handle: SessionHandle,
    mirror: JoinHandle<()>,
}

pub struct SessionController {
    slot: Mutex<Option<LiveSession>>,
    signals: Arc<watch::Sender<SessionSignals>>,
    metrics: Arc<SessionMetrics>,
}

impl SessionController {
    pub fn new() -> Self {
        let (signals, _) = watch::channel(SessionSignals::default());
        Self {
            slot: Mutex::new(None),
            signals: Arc::new(signals),
            metrics: Arc::new(SessionMetrics::default()),
        }
    }

    /// Start a session unless one is already in progress.
    ///
    /// A live session is left untouched and `Err(AlreadyActive)` is returned.
    pub async fn start(
        &self,
        config: SessionConfig,
        devices: Arc<dyn DeviceProvider>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Result<SessionSignals, SessionError> {
        let mut slot = self.slot.lock().await;

        if let Some(live) = slot.as_ref() {
            if !live.handle.is_finished() {
                live.handle.request_start().await?;
            }
        }
        if let Some(finished) = slot.take() {
            // The mirror ends as soon as the finished driver drops its sender
            let _ = finished.mirror.await;
        }

        let handle = Session::start(
            config,
            SessionDeps {
                devices,
                connector,
                metrics: self.metrics.clone(),
            },
        );
        info!(session_id = %handle.id(), "Session slot taken");

        let mirror = tokio::spawn(mirror_signals(handle.subscribe(), self.signals.clone()));
        let signals = handle.signals();
        self.signals.send_replace(signals.clone());

        *slot = Some(LiveSession { handle, mirror });
        Ok(signals)
    }

    /// Stop the live session, if any, and wait for its cleanup.
    pub async fn stop(&self) -> SessionSignals {
        let mut slot = self.slot.lock().await;

        match slot.take() {
            Some(live) => {
                let signals = live.handle.stop().await;
                let _ = live.mirror.await;
                self.signals.send_replace(signals.clone());
                signals
            }
            None => {
                debug!("Stop requested with no session in the slot");
                self.current()
            }
        }
    }

    /// Latest signals of the current or most recent session.
    pub fn current(&self) -> SessionSignals {
        self.signals.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSignals> {
        self.signals.subscribe()
    }

    pub fn metrics(&self) -> SessionMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy one session's signals into the controller channel until the session ends.
async fn mirror_signals(mut source: watch::Receiver<SessionSignals>, target: Arc<watch::Sender<SessionSignals>>) {
    loop {
        let signals = source.borrow_and_update().clone();
        target.send_if_modified(|current| {
            if *current == signals {
                false
            } else {
                *current = signals;
                true
            }
        });

        if source.changed().await.is_err() {
            break;
        }
    }

    // The final value may have landed after the last wake-up
    let last = source.borrow().clone();
    target.send_replace(last);
}
