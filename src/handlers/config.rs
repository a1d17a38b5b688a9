use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// Shown in place of a configured API key.
const REDACTED: &str = "<redacted>";

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": redacted(&config)?
    })))
}

/// Merge a partial configuration. Takes effect when the next session starts.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let mut patch = body.into_inner();
    // A config echoed back from GET must not overwrite the real key
    if let Some(remote) = patch.get_mut("remote").and_then(|r| r.as_object_mut()) {
        if remote.get("api_key").and_then(|k| k.as_str()) == Some(REDACTED) {
            remote.remove("api_key");
        }
    }
    let json_str = serde_json::to_string(&patch)?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;
    info!("Configuration updated");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated, applies to the next session",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": redacted(&current_config)?
    })))
}

fn redacted(config: &AppConfig) -> AppResult<serde_json::Value> {
    let mut value = serde_json::to_value(config).map_err(|e| AppError::Internal(e.to_string()))?;
    if !config.remote.api_key.is_empty() {
        value["remote"]["api_key"] = json!(REDACTED);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    fn app_state() -> AppState {
        let mut config = AppConfig::default();
        config.remote.api_key = "secret-key".to_string();
        AppState::new(config)
    }

    #[actix_web::test]
    async fn test_get_config_hides_api_key() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["config"]["remote"]["api_key"], REDACTED);
        assert_eq!(body["config"]["audio"]["output_sample_rate"], 24000);
        assert_eq!(body["config"]["audio"]["drain_policy"], "epsilon");
    }

    #[actix_web::test]
    async fn test_update_config_merges_partial() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({
                "audio": { "drain_policy": "counted" },
                "remote": { "voice": "Kore", "api_key": REDACTED }
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let config = state.get_config();
        assert_eq!(config.audio.drain_policy, crate::audio::scheduler::DrainPolicy::Counted);
        assert_eq!(config.remote.voice, "Kore");
        assert_eq!(config.remote.api_key, "secret-key");
        assert_eq!(config.audio.input_sample_rate, 16000);
    }

    #[actix_web::test]
    async fn test_update_config_rejects_invalid_values() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "audio": { "fft_size": 100 } }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "validation_error");
        assert_eq!(state.get_config().audio.fft_size, 256);
    }
}
