//! # Configuration Management
//!
//! Loads the daemon configuration from layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP_` prefix
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platform convention)
//! 2. Environment variables, nested with a double underscore
//!    (`APP_REMOTE__API_KEY`, `APP_AUDIO__DRAIN_POLICY`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values
//!
//! ## Sections:
//! - **server**: bind address of the control surface
//! - **remote**: endpoint and persona of the conversational engine
//! - **audio**: sample rates, block sizes and indicator cadence
//! - **devices**: system microphone/speaker, or WAV files for headless runs
//! - **timeouts**: bounds on the suspending startup steps and on outbound sends
//!
//! ## Rust Concepts:
//! - **serde derive**: every section round-trips through TOML, env vars and JSON
//! - **`#[serde(rename_all = "snake_case")]`**: enum variants read as `system` / `file`
//! - **`Option<T>`**: settings that are genuinely optional (device names, WAV paths)
//!
//! Changes made at runtime (`PUT /api/v1/config`) apply to the next session.

use crate::audio::scheduler::{DrainPolicy, DEFAULT_DRAIN_EPSILON};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration, one field per section.
///
/// ## Rust Concepts:
/// - **`PartialEq`**: lets a failed runtime update prove it left the config untouched
/// - **Clone**: each session takes its own snapshot when it starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub remote: RemoteConfig,
    pub audio: AudioConfig,
    pub devices: DevicesConfig,
    pub timeouts: TimeoutsConfig,
}

/// Where the control surface listens.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: only the local presentation layer can reach the daemon
/// - `host = "0.0.0.0"`: expose the control surface on every interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16, // 0 is rejected by validate()
}

/// The remote conversational engine.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL (`ws://` or `wss://`) of the live engine
/// - `api_key`: appended to the endpoint as the `key` query parameter
/// - `model`: model name, `models/` prefix optional
/// - `voice`: prebuilt voice for synthesized speech, empty for the engine default
/// - `system_instruction`: persona text, passed through verbatim
/// - `begin_message`: text turn sent once the channel opens, empty to skip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub begin_message: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            api_key: String::new(),
            model: "gemini-2.0-flash-exp".to_string(),
            voice: "Puck".to_string(),
            system_instruction: String::new(),
            begin_message: "Hello".to_string(), // Prompts the engine to speak first
        }
    }
}

/// Audio format and indicator tuning.
///
/// ## Fields:
/// - `input_sample_rate`: rate frames are sent at (captured audio is resampled to it)
/// - `output_sample_rate`: rate of the playback device and of inbound audio by default
/// - `capture_block_size`: frames per captured block
/// - `volume_tick_ms`: how often the volume signal is recomputed
/// - `fft_size`: analyser window, a power of two
/// - `drain_policy` / `drain_epsilon_secs`: when the AI-speaking flag drops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub capture_block_size: usize,
    pub volume_tick_ms: u64,
    pub fft_size: usize,
    pub drain_policy: DrainPolicy,
    pub drain_epsilon_secs: f64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16000,  // What the engine expects to hear
            output_sample_rate: 24000, // What the engine speaks at
            capture_block_size: 4096,  // ~85 ms at 48 kHz, ~256 ms at 16 kHz
            volume_tick_ms: 16,        // Roughly one display frame
            fft_size: 256,
            drain_policy: DrainPolicy::Epsilon,
            drain_epsilon_secs: DEFAULT_DRAIN_EPSILON,
        }
    }
}

/// Which kind of audio hardware a session runs against.
///
/// The default follows the build: `system` when the `system-audio` feature is
/// compiled in, `file` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceBackend {
    /// Microphone and speaker through the host audio API
    System,
    /// WAV file in, tokio clock out. For machines without audio hardware.
    File,
}

impl Default for DeviceBackend {
    fn default() -> Self {
        if cfg!(feature = "system-audio") {
            DeviceBackend::System
        } else {
            DeviceBackend::File
        }
    }
}

/// Audio device selection.
///
/// ## Fields:
/// - `backend`: `system` or `file` (see [`DeviceBackend`] for the default)
/// - `input_device` / `output_device`: device names for the `system` backend,
///   unset for the host defaults
/// - `input_wav`: capture source for the `file` backend. Unset means the
///   session streams silence
/// - `output_wav`: where the `file` backend writes the played conversation
///   when a session ends, unset to discard it
///
/// ## Example (`config.toml`):
/// ```toml
/// [devices]
/// backend = "file"
/// input_wav = "/tmp/question.wav"
/// output_wav = "/tmp/answer.wav"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevicesConfig {
    pub backend: DeviceBackend,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub input_wav: Option<PathBuf>,
    pub output_wav: Option<PathBuf>,
}

/// Bounds on every step that waits on something outside the process.
///
/// ## Fields:
/// - `device_acquire_ms`: per device, covers permission prompts
/// - `channel_open_ms`: connect plus the engine's setup acknowledgment
/// - `send_ms`: one outbound frame or text; a peer that stops reading for
///   longer fails the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    pub device_acquire_ms: u64,
    pub channel_open_ms: u64,
    pub send_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            device_acquire_ms: 10_000,
            channel_open_ms: 15_000,
            send_ms: 5_000,
        }
    }
}

impl TimeoutsConfig {
    pub fn device_acquire(&self) -> Duration {
        Duration::from_millis(self.device_acquire_ms)
    }

    pub fn channel_open(&self) -> Duration {
        Duration::from_millis(self.channel_open_ms)
    }

    pub fn send(&self) -> Duration {
        Duration::from_millis(self.send_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            remote: RemoteConfig::default(),
            audio: AudioConfig::default(),
            devices: DevicesConfig::default(),
            timeouts: TimeoutsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: override the control surface port
    /// - `APP_REMOTE__API_KEY=...`: credentials for the remote engine
    /// - `APP_DEVICES__BACKEND=file`: run without audio hardware
    /// - `APP_DEVICES__INPUT_WAV=/tmp/mic.wav`: capture source for the file backend
    /// - `APP_AUDIO__DRAIN_POLICY=counted`: exact drain detection
    /// - `PORT=3000`: deployment platform override
    ///
    /// ## Rust Concepts:
    /// - **Builder pattern**: each `add_source` layers over the previous one
    /// - **`try_deserialize()`**: the merged tree is checked against the structs,
    ///   so a typo in an enum value fails at startup rather than mid-session
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let endpoint = self.remote.endpoint.trim();
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "Remote endpoint must be a ws:// or wss:// URL, got '{}'",
                self.remote.endpoint
            ));
        }

        if self.remote.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Remote model cannot be empty"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.capture_block_size == 0 {
            return Err(anyhow::anyhow!("Capture block size must be greater than 0"));
        }

        if self.audio.volume_tick_ms == 0 {
            return Err(anyhow::anyhow!("Volume tick must be greater than 0 ms"));
        }

        if self.audio.fft_size < 32 || !self.audio.fft_size.is_power_of_two() {
            return Err(anyhow::anyhow!(
                "FFT size must be a power of two of at least 32, got {}",
                self.audio.fft_size
            ));
        }

        if !self.audio.drain_epsilon_secs.is_finite() || self.audio.drain_epsilon_secs < 0.0 {
            return Err(anyhow::anyhow!("Drain epsilon must be a non-negative number of seconds"));
        }

        if self.devices.backend == DeviceBackend::System && !cfg!(feature = "system-audio") {
            return Err(anyhow::anyhow!(
                "Device backend 'system' needs a build with the system-audio feature"
            ));
        }

        if self.timeouts.device_acquire_ms == 0 || self.timeouts.channel_open_ms == 0 || self.timeouts.send_ms == 0 {
            return Err(anyhow::anyhow!("Timeouts must be greater than 0 ms"));
        }

        Ok(())
    }

    /// Apply a partial JSON update, e.g. `{"audio": {"drain_policy": "counted"}}`.
    ///
    /// The update is merged over the current values and validated as a whole.
    /// On any error the configuration is left untouched.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        if !partial.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, partial);

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;

        *self = updated;
        Ok(())
    }
}

/// Recursively overlay `patch` onto `base`. Objects merge, everything else replaces.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}
