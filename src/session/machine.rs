//! # Session State Machine
//!
//! Pure transition function. Given the current state and one event it returns the
//! next state and the effects the driver must run, in order. No I/O happens here.
//!
//! ## States:
//! - **Idle**: nothing held
//! - **Connecting**: acquiring devices and waiting for the channel acknowledgment
//! - **Active**: streaming in both directions
//! - **Closing**: tearing down after a stop or a remote close
//! - **Failed**: tearing down after an error; the error stays visible afterwards
//!
//! Start is single-flight: a start request in any state but `Idle` is rejected
//! and leaves the session alone.

use crate::remote::InlineAudio;
use crate::session::SessionError;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StartRequested,
    ChannelOpened,
    AcquisitionFailed(SessionError),
    ChannelError(SessionError),
    ChannelClosed { reason: Option<String> },
    StopRequested,
    InboundAudio(InlineAudio),
    TurnComplete,
    Interrupted,
    /// The capture stream ended underneath an active session
    DeviceLost(String),
    CleanupFinished,
}

/// Remote turn markers that are only logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    TurnComplete,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    AcquireResources,
    SendBegin,
    StartCapture,
    StartMeter,
    PlayAudio(InlineAudio),
    Observe(Observation),
    ReportError(SessionError),
    Cleanup,
    RejectStart,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: SessionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(state: SessionState, effects: Vec<Effect>) -> Self {
        Self { state, effects }
    }

    fn stay(state: SessionState) -> Self {
        Self::to(state, Vec::new())
    }
}

pub fn transition(state: SessionState, event: &SessionEvent) -> Transition {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (S::Idle, E::StartRequested) => Transition::to(S::Connecting, vec![Effect::AcquireResources]),
        (_, E::StartRequested) => Transition::to(state, vec![Effect::RejectStart]),

        (S::Connecting, E::ChannelOpened) => Transition::to(
            S::Active,
            vec![Effect::SendBegin, Effect::StartCapture, Effect::StartMeter],
        ),
        (S::Connecting, E::AcquisitionFailed(err)) | (S::Connecting, E::ChannelError(err)) => {
            Transition::to(S::Failed, vec![Effect::ReportError(err.clone()), Effect::Cleanup])
        }
        (S::Connecting, E::ChannelClosed { reason }) => {
            let err = SessionError::ChannelOpen(match reason {
                Some(reason) => format!("closed before acknowledgment: {}", reason),
                None => "closed before acknowledgment".to_string(),
            });
            Transition::to(S::Failed, vec![Effect::ReportError(err), Effect::Cleanup])
        }

        (S::Connecting, E::StopRequested) | (S::Active, E::StopRequested) => {
            Transition::to(S::Closing, vec![Effect::Cleanup])
        }

        (S::Active, E::InboundAudio(audio)) => Transition::to(S::Active, vec![Effect::PlayAudio(audio.clone())]),
        (S::Active, E::TurnComplete) => {
            Transition::to(S::Active, vec![Effect::Observe(Observation::TurnComplete)])
        }
        (S::Active, E::Interrupted) => Transition::to(S::Active, vec![Effect::Observe(Observation::Interrupted)]),
        (S::Active, E::ChannelError(err)) => {
            Transition::to(S::Failed, vec![Effect::ReportError(err.clone()), Effect::Cleanup])
        }
        (S::Active, E::ChannelClosed { .. }) => Transition::to(S::Closing, vec![Effect::Cleanup]),
        (S::Active, E::DeviceLost(reason)) => Transition::to(
            S::Failed,
            vec![
                Effect::ReportError(SessionError::DeviceLost(reason.clone())),
                Effect::Cleanup,
            ],
        ),

        (S::Closing, E::CleanupFinished) | (S::Failed, E::CleanupFinished) => Transition::stay(S::Idle),

        _ => Transition::stay(state),
    }
}
