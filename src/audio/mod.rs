//! # Audio Module
//!
//! Everything that touches samples: framing for the wire, the capture path,
//! playback scheduling, and the level metering behind the indicator.
//!
//! ## Key Components:
//! - **PCM Framer** (`pcm`): float samples ↔ 16-bit little-endian frames
//! - **Spectrum Analyser** (`analyser`): windowed FFT snapshot of recent input
//! - **Volume Meter** (`meter`): 0..1 activity level from a spectrum snapshot
//! - **Resampler** (`resample`): band-limited rate conversion (rubato FFT resampler)
//! - **Capture Pipeline** (`capture`): resample → analyse → encode
//! - **Playback Scheduler** (`scheduler`): gapless placement on the output timeline
//! - **Mixer** (`mixer`): sample-accurate timeline that output devices render from
//! - **Devices** (`device`): input/output contracts and the headless file backend
//! - **System Devices** (`system`, `system-audio` feature): microphone and speaker via cpal
//!
//! ## Audio Format:
//! - **Send path**: 16 kHz mono 16-bit PCM (device-native rate resampled on the way out)
//! - **Receive path**: 24 kHz mono 16-bit PCM unless the message declares another rate

pub mod analyser;
pub mod capture;
pub mod device;
pub mod meter;
pub mod mixer;
pub mod pcm;
pub mod resample;
pub mod scheduler;
#[cfg(feature = "system-audio")]
pub mod system;
