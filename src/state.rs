//! # Application State
//!
//! Shared by every HTTP handler and the signals socket.
//!
//! ## Contents:
//! - **config**: `Arc<RwLock<AppConfig>>`, many readers or one writer; updates
//!   apply to the next session that starts
//! - **metrics**: request/error counters and per-endpoint timings
//! - **sessions**: the single session slot, see [`SessionController`]
//!
//! Device and channel backends are built from the configuration each time a
//! session starts, so a `PUT /api/v1/config` switching the device backend or
//! the remote endpoint never touches a running session.
//!
//! ## Rust Concepts:
//! - **`#[derive(Clone)]` on `AppState`**: every field is an `Arc`, so each
//!   actix worker gets a cheap handle to the same state
//! - **`Arc<dyn DeviceProvider>`**: the backend is picked at runtime from config,
//!   behind one trait object
//! - **`#[cfg(feature = ...)]` match arms**: the `system` backend only exists in
//!   builds that link the sound card library

use crate::audio::device::{DeviceProvider, LocalDevices};
#[cfg(feature = "system-audio")]
use crate::audio::system::SystemDevices;
use crate::config::{AppConfig, DeviceBackend, DevicesConfig};
use crate::remote::{ChannelConnector, LiveConnector};
use crate::session::{SessionConfig, SessionController, SessionError, SessionSignals};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
#[cfg(not(feature = "system-audio"))]
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub sessions: Arc<SessionController>,
    backends: Option<SessionBackends>, // test override, None in the daemon
    pub start_time: Instant,
}

/// Where a new session gets its devices and its channel.
#[derive(Clone)]
pub struct SessionBackends {
    pub devices: Arc<dyn DeviceProvider>,
    pub connector: Arc<dyn ChannelConnector>,
}

impl SessionBackends {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            devices: device_provider(&config.devices),
            connector: Arc::new(LiveConnector::new(config.remote.clone())),
        }
    }
}

fn device_provider(devices: &DevicesConfig) -> Arc<dyn DeviceProvider> {
    let files = || LocalDevices::new(devices.input_wav.clone(), devices.output_wav.clone());

    match devices.backend {
        #[cfg(feature = "system-audio")]
        DeviceBackend::System => Arc::new(SystemDevices::new(
            devices.input_device.clone(),
            devices.output_device.clone(),
        )),
        // validate() refuses this combination; kept for configs built by hand
        #[cfg(not(feature = "system-audio"))]
        DeviceBackend::System => {
            warn!("Built without system-audio, using the file backend");
            Arc::new(files())
        }
        DeviceBackend::File => Arc::new(files()),
    }
}

#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: `"{method} {route pattern}"`, e.g. `"POST /api/v1/session/start"`
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            sessions: Arc::new(SessionController::new()),
            backends: None,
            start_time: Instant::now(),
        }
    }

    /// State whose sessions run against fixed backends instead of the configured ones.
    #[cfg(test)]
    pub fn with_backends(config: AppConfig, backends: SessionBackends) -> Self {
        Self {
            backends: Some(backends),
            ..Self::new(config)
        }
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap() = new_config;
        Ok(())
    }

    /// Start a session with the configuration as it is right now.
    pub async fn start_session(&self) -> Result<SessionSignals, SessionError> {
        let config = self.get_config();
        let backends = match &self.backends {
            Some(backends) => backends.clone(),
            None => SessionBackends::from_config(&config),
        };

        self.sessions
            .start(SessionConfig::from(&config), backends.devices, backends.connector)
            .await
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Copy of the metrics, so no lock is held while a response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
