//! # Live Engine Channel
//!
//! WebSocket implementation of [`RemoteChannel`] for the live conversational
//! engine.
//!
//! ## Connection Flow:
//! 1. Connect to `remote.endpoint` with the API key as the `key` query parameter
//! 2. Send the setup frame (model, voice, system instruction)
//! 3. Spawn the reader task; the channel counts as open once the engine
//!    answers with `setupComplete`
//!
//! ## Halves:
//! - **Sink** (owned by [`LiveChannel`]): outbound audio and text, one JSON
//!   text frame each
//! - **Stream** (owned by the reader task): inbound frames parsed and forwarded
//!   to the session as [`ChannelEvent`]s
//!
//! ## Rust Concepts:
//! - **`StreamExt::split`**: the socket becomes a sink and a stream that can live
//!   on different tasks
//! - **`Arc<AtomicBool>`**: the open flag is written by the reader and read by
//!   the sender without a lock

use crate::audio::pcm::AudioFrame;
use crate::config::RemoteConfig;
use crate::remote::protocol::{self, ClientMessage, ServerFrame};
use crate::remote::{ChannelConnector, ChannelError, ChannelEvent, ChannelEventSender, RemoteChannel};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the engine described by [`RemoteConfig`].
#[derive(Debug, Clone)]
pub struct LiveConnector {
    config: RemoteConfig,
}

impl LiveConnector {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }

    /// Endpoint with the API key attached as a query parameter.
    ///
    /// The key is percent-encoded, so characters like `&`, `=` or `+` reach
    /// the engine intact. Existing query parameters are kept.
    pub fn url(&self) -> Result<Url, ChannelError> {
        let mut url = Url::parse(self.config.endpoint.trim())
            .map_err(|e| ChannelError::Open(format!("invalid endpoint '{}': {}", self.config.endpoint, e)))?;
        if !self.config.api_key.is_empty() {
            url.query_pairs_mut().append_pair("key", &self.config.api_key);
        }
        Ok(url)
    }
}

#[async_trait]
impl ChannelConnector for LiveConnector {
    async fn connect(&self, events: ChannelEventSender) -> Result<Box<dyn RemoteChannel>, ChannelError> {
        if self.config.api_key.is_empty() {
            warn!("No API key configured for the remote engine");
        }

        let url = self.url()?;
        let (stream, response) = connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Open(e.to_string()))?;
        info!(
            endpoint = %self.config.endpoint,
            status = response.status().as_u16(),
            "Connected to remote engine"
        );

        let (mut sink, stream) = stream.split();

        // Nothing may be sent before the setup frame

        let setup = protocol::setup_message(
            &self.config.model,
            &self.config.voice,
            &self.config.system_instruction,
        );
        let setup = serde_json::to_string(&setup).map_err(|e| ChannelError::Open(e.to_string()))?;
        sink.send(Message::Text(setup))
            .await
            .map_err(|e| ChannelError::Open(e.to_string()))?;

        let open = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(stream, events, open.clone()));

        Ok(Box::new(LiveChannel { sink, reader, open }))
    }
}

/// An established engine connection. Dropping it stops the reader task.
pub struct LiveChannel {
    sink: SplitSink<WsStream, Message>,
    reader: JoinHandle<()>,
    open: Arc<AtomicBool>,
}

impl LiveChannel {
    async fn send_json(&mut self, message: &ClientMessage) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        let text = serde_json::to_string(message).map_err(|e| ChannelError::Send(e.to_string()))?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))
    }
}

#[async_trait]
impl RemoteChannel for LiveChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_audio_frame(&mut self, frame: &AudioFrame) -> Result<(), ChannelError> {
        self.send_json(&protocol::audio_message(frame)).await
    }

    async fn send_text(&mut self, text: &str) -> Result<(), ChannelError> {
        self.send_json(&protocol::text_message(text)).await
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.open.store(false, Ordering::SeqCst);
        self.reader.abort(); // no Closed event for a close we asked for

        self.sink
            .send(Message::Close(None))
            .await
            .map_err(|e| ChannelError::Close(e.to_string()))?;
        self.sink.close().await.map_err(|e| ChannelError::Close(e.to_string()))
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Forward inbound frames into the session's event queue until the socket ends.
///
/// Ends with one `Closed` or `Error` event, unless the session dropped its
/// queue or aborted the reader first. Malformed frames are logged and skipped.
async fn read_loop(mut stream: SplitStream<WsStream>, events: ChannelEventSender, open: Arc<AtomicBool>) {
    while let Some(message) = stream.next().await {
        let raw = match message {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(frame)) => {
                open.store(false, Ordering::SeqCst);
                let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                info!(reason = ?reason, "Remote engine closed the channel");
                let _ = events.send(ChannelEvent::Closed { reason });
                return;
            }
            Ok(_) => continue, // ping/pong handled by tungstenite
            Err(e) => {
                open.store(false, Ordering::SeqCst);
                let _ = events.send(ChannelEvent::Error(e.to_string()));
                return;
            }
        };

        let event = match protocol::parse_server_frame(&raw) {
            Ok(ServerFrame::SetupComplete) => {
                open.store(true, Ordering::SeqCst);
                ChannelEvent::Opened
            }
            Ok(ServerFrame::Content(message)) => ChannelEvent::Message(message),
            Ok(ServerFrame::GoAway) => {
                warn!("Remote engine announced disconnect");
                continue;
            }
            Ok(ServerFrame::Ignored) => continue,
            Err(e) => {
                warn!(error = %e, bytes = raw.len(), "Ignoring malformed frame from remote engine");
                continue;
            }
        };

        if events.send(event).is_err() {
            debug!("Session event queue closed, stopping channel reader");
            return;
        }
    }

    open.store(false, Ordering::SeqCst);
    let _ = events.send(ChannelEvent::Closed { reason: None });
}
