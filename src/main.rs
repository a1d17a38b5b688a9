//! # voice-duplex
//!
//! Local control daemon for a real-time voice conversation with a remote
//! speech engine. It owns a single session slot: capture audio, stream it to
//! the engine, play the synthesized reply gaplessly, and publish the
//! connected / speaking / volume / error signals.
//!
//! ## Application Architecture:
//! - **audio**: PCM framing, capture, playback scheduling, metering, devices
//! - **remote**: the bidirectional channel to the engine (WebSocket)
//! - **session**: lifecycle state machine, its driver task, and the session slot
//! - **config**: defaults, `config.toml`, `APP_*` environment variables
//! - **state**: shared application state and request metrics
//! - **handlers**, **health**, **signals**: the HTTP and WebSocket control surface
//! - **middleware**: request logging and metrics
//! - **error**: HTTP error responses
//!
//! ## Control Surface:
//! - `GET  /api/v1/health`, `GET /api/v1/metrics`: liveness and request metrics
//! - `GET|PUT /api/v1/config`: read or patch the configuration (next session)
//! - `GET  /api/v1/session`: current lifecycle state and last error
//! - `POST /api/v1/session/start|stop`: claim or release the session slot
//! - `GET  /ws/signals`: live connected / speaking / volume / error updates
//!
//! ## Startup Sequence:
//! 1. `.env` and tracing, so configuration errors are logged
//! 2. Layered configuration, validated before anything binds
//! 3. Shared state, then the HTTP server on `server.host:server.port`
//! 4. Wait for the server to exit or for SIGTERM/SIGINT
//!
//! ## Rust Concepts:
//! - **`#[actix_web::main]`**: runs `main` on the actix system runtime (tokio underneath)
//! - **`anyhow::Result`**: startup failures carry context up to the process exit
//! - **`tokio::select!`**: whichever of server exit and shutdown signal comes first wins

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod remote;
mod session;
mod signals;
mod state;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::{AppConfig, DeviceBackend, DevicesConfig};
use error::AppError;
use state::AppState;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok(); // .env is optional
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-duplex v{}", env!("CARGO_PKG_VERSION"));
    info!(
        endpoint = %config.remote.endpoint,
        model = %config.remote.model,
        api_key_configured = !config.remote.api_key.is_empty(),
        "Remote engine configured"
    );
    log_device_backend(&config.devices);

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600); // local UI on any origin

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/session", web::get().to(handlers::get_session))
                    .route("/session/start", web::post().to(handlers::start_session))
                    .route("/session/stop", web::post().to(handlers::stop_session)),
            )
            .route("/ws/signals", web::get().to(signals::signals_websocket))
            .route("/health", web::get().to(health::health_check))
            .default_service(web::to(not_found))
    })
    .bind(&bind_addr)?
    .disable_signals()
    .run();

    // Signals are handled below so the session slot is released before the server stops
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping session and server...");
            let last = app_state.sessions.stop().await; // closes devices and channel
            info!(state = %last.state, "Session slot released");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Say up front what a session will capture from and play to.
fn log_device_backend(devices: &DevicesConfig) {
    match devices.backend {
        DeviceBackend::System => info!(
            input = devices.input_device.as_deref().unwrap_or("default"),
            output = devices.output_device.as_deref().unwrap_or("default"),
            "Sessions use the system microphone and speaker"
        ),
        DeviceBackend::File => {
            match &devices.input_wav {
                Some(path) => info!(input = %path.display(), "Sessions capture from a WAV file"),
                None => info!("No capture file configured, sessions stream silence"),
            }
            match &devices.output_wav {
                Some(path) => info!(output = %path.display(), "Played audio is written when a session ends"),
                None => info!("No output file configured, played audio is discarded"),
            }
        }
    }
}

async fn not_found(req: actix_web::HttpRequest) -> Result<actix_web::HttpResponse, AppError> {
    Err(AppError::NotFound(format!("No route for {} {}", req.method(), req.path())))
}

/// `RUST_LOG` wins; otherwise `voice_duplex=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_duplex=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGTERM or SIGINT. Falls back to Ctrl-C alone if the Unix
/// handlers cannot be installed.
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let handlers = signal(SignalKind::terminate()).and_then(|term| Ok((term, signal(SignalKind::interrupt())?)));

    match handlers {
        Ok((mut sigterm, mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }
        Err(e) => {
            warn!(error = %e, "Could not install signal handlers, waiting for Ctrl-C only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Ctrl-C handler failed");
                std::future::pending::<()>().await;
            }
        }
    }
}
