//! Start, stop and inspect the conversation session.
//!
//! ## Endpoints:
//! - `POST /api/v1/session/start`: 202 once the session is connecting, 409 if one is live
//! - `POST /api/v1/session/stop`: 200 after cleanup has finished
//! - `GET /api/v1/session`: latest signals

use crate::error::AppResult;
use crate::session::SessionSignals;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn start_session(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let signals = state.start_session().await?;
    info!(session_id = ?signals.session_id, "Session start accepted");

    Ok(HttpResponse::Accepted().json(envelope(signals)))
}

pub async fn stop_session(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let signals = state.sessions.stop().await;
    Ok(HttpResponse::Ok().json(envelope(signals)))
}

pub async fn get_session(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(envelope(state.sessions.current()))
}

fn envelope(signals: SessionSignals) -> serde_json::Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": signals
    })
}
