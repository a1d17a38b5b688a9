//! # Signals WebSocket
//!
//! `GET /ws/signals` upgrades to a WebSocket that pushes the session signals
//! (connected, AI speaking, volume, last error) to a presentation layer.
//!
//! ## Protocol:
//! 1. **Connect**: the current snapshot is sent immediately
//! 2. **Push**: a new `signals` message follows every visible change
//! 3. **Commands**: the client may send `{"type": "start"}` or `{"type": "stop"}`
//! 4. **Heartbeat**: the server sends `ping` every 30 s and drops clients silent for 60 s
//!
//! ## Message Format:
//! - **Server → Client**: `{"type": "signals", "session": {...}}`, `error`, `ping`
//! - **Client → Server**: `start`, `stop`, `pong`

use crate::session::SessionSignals;
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Signals { session: SessionSignals },
    Error { code: String, message: String },
    Ping { timestamp: u64 },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Start,
    Stop,
    Pong { timestamp: u64 },
}

/// One connected observer.
pub struct SignalsSocket {
    state: web::Data<AppState>,
    last_heartbeat: Instant,
}

impl SignalsSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            state,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(error = %e, "Failed to serialize signals message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: String) {
        self.send(
            ctx,
            &ServerMessage::Error {
                code: code.to_string(),
                message,
            },
        );
    }

    fn handle_command(&mut self, command: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let state = self.state.clone();
        match command {
            ClientMessage::Start => {
                let fut = async move { state.start_session().await }
                    .into_actor(self)
                    .map(|result, act, ctx| {
                        if let Err(e) = result {
                            act.send_error(ctx, "start_rejected", e.to_string());
                        }
                    });
                ctx.spawn(fut);
            }
            ClientMessage::Stop => {
                // Signals already carry the outcome
                ctx.spawn(
                    async move {
                        state.sessions.stop().await;
                    }
                    .into_actor(self),
                );
            }
            ClientMessage::Pong { timestamp } => {
                debug!(timestamp, "Heartbeat pong");
                self.last_heartbeat = Instant::now();
            }
        }
    }
}

impl Actor for SignalsSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Signals socket connected");

        ctx.add_stream(WatchStream::new(self.state.sessions.subscribe()));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Signals socket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
            act.send(ctx, &ServerMessage::Ping { timestamp });
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Signals socket disconnected");
    }
}

/// Session signal changes.
impl StreamHandler<SessionSignals> for SignalsSocket {
    fn handle(&mut self, signals: SessionSignals, ctx: &mut Self::Context) {
        self.send(ctx, &ServerMessage::Signals { session: signals });
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SignalsSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(command) => self.handle_command(command, ctx),
                Err(err) => self.send_error(ctx, "invalid_json", format!("Invalid JSON: {}", err)),
            },
            Ok(ws::Message::Binary(_)) => {
                self.send_error(ctx, "unsupported", "Binary frames are not accepted".to_string());
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(?reason, "Signals socket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "Signals socket protocol error");
                ctx.stop();
            }
        }
    }
}

pub async fn signals_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(peer = ?req.connection_info().peer_addr(), "New signals socket request");
    ws::start(SignalsSocket::new(state), &req, stream)
}
