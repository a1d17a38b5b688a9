use crate::config::AppConfig;
use crate::session::{SessionSignals, SessionState};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let session = state.sessions.current();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "voice-duplex",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate()
        },
        "memory": get_memory_info(),
        "remote": remote_status(&config),
        "session": session_status(&session)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "sessions": state.sessions.metrics(),
        "memory": get_memory_info()
    }))
}

/// Never includes the API key itself.
fn remote_status(config: &AppConfig) -> serde_json::Value {
    json!({
        "endpoint": config.remote.endpoint,
        "model": config.remote.model,
        "voice": config.remote.voice,
        "api_key_configured": !config.remote.api_key.is_empty()
    })
}

fn session_status(session: &SessionSignals) -> serde_json::Value {
    let status = match session.state {
        SessionState::Idle if session.error.is_some() => "idle_after_error",
        SessionState::Idle => "idle",
        SessionState::Connecting => "connecting",
        SessionState::Active => "streaming",
        SessionState::Closing | SessionState::Failed => "shutting_down",
    };

    json!({
        "status": status,
        "signals": session
    })
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let read_kb = |prefix: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(prefix))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": read_kb("VmRSS:"),
                "virtual_memory_bytes": read_kb("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {} on this platform", process::id())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_idle_session() {
        let mut config = AppConfig::default();
        config.remote.api_key = "secret-key".to_string();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(config)))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"]["name"], "voice-duplex");
        assert_eq!(body["session"]["status"], "idle");
        assert_eq!(body["remote"]["api_key_configured"], true);
        assert!(!body.to_string().contains("secret-key"));
    }

    #[actix_web::test]
    async fn test_metrics_include_session_counters() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::new(AppConfig::default())))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["sessions"]["started"], 0);
        assert_eq!(body["sessions"]["decode_errors"], 0);
        assert!(body["endpoints"].as_array().unwrap().is_empty());
    }

    #[actix_web::test]
    async fn test_session_status_names() {
        let failed_then_idle = SessionSignals {
            error: Some("channel failed: reset".to_string()),
            ..SessionSignals::default()
        };
        assert_eq!(session_status(&failed_then_idle)["status"], "idle_after_error");

        let active = SessionSignals {
            state: SessionState::Active,
            ..SessionSignals::default()
        };
        assert_eq!(session_status(&active)["status"], "streaming");
    }
}
