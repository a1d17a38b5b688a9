//! # Remote Conversational Channel
//!
//! The session treats the remote speech engine as an opaque, ordered, bidirectional
//! message channel. This module defines that boundary and ships the WebSocket
//! implementation used in production.
//!
//! ## Event Delivery:
//! Lifecycle callbacks (`open`, `message`, `close`, `error`) are not callbacks here.
//! A connector is handed the sending half of the session's event queue and pushes
//! [`ChannelEvent`] values into it, in the order the transport delivers them.

pub mod live;
pub mod protocol;

use crate::audio::pcm::AudioFrame;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use live::LiveConnector;
pub use protocol::{InboundMessage, InlineAudio};

/// Sending half of the session's channel event queue.
pub type ChannelEventSender = mpsc::UnboundedSender<ChannelEvent>;

/// Something the remote side did.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The remote side acknowledged the session; outbound traffic may flow.
    Opened,
    /// One inbound payload (audio and/or turn markers).
    Message(InboundMessage),
    /// The remote side closed the channel.
    Closed { reason: Option<String> },
    /// Transport failure after the channel was established.
    Error(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("failed to open channel: {0}")]
    Open(String),

    #[error("channel is not open")]
    NotOpen,

    #[error("failed to send on channel: {0}")]
    Send(String),

    #[error("failed to close channel: {0}")]
    Close(String),
}

/// Outbound half of an established channel.
#[async_trait]
pub trait RemoteChannel: Send {
    /// Whether the remote side has acknowledged the channel and it has not closed since.
    fn is_open(&self) -> bool;

    async fn send_audio_frame(&mut self, frame: &AudioFrame) -> Result<(), ChannelError>;

    async fn send_text(&mut self, text: &str) -> Result<(), ChannelError>;

    /// Best-effort close. Callers log failures and carry on.
    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// Opens channels to the remote engine.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, events: ChannelEventSender) -> Result<Box<dyn RemoteChannel>, ChannelError>;
}
