//! Volume metering for the listening/speaking indicator.

/// Mean bin value that maps to full scale.
pub const NORMALIZATION: f32 = 100.0;

/// Derives a 0..1 activity level from a byte frequency snapshot.
///
/// Only the most recent value is kept; there is no history.
#[derive(Debug, Default)]
pub struct VolumeMeter {
    last: f32,
}

impl VolumeMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the level for one snapshot and remember it.
    ///
    /// Mean of all bins divided by [`NORMALIZATION`], clamped to [0, 1].
    /// An empty snapshot reads as silence.
    pub fn sample(&mut self, bins: &[u8]) -> f32 {
        self.last = level(bins);
        self.last
    }

    /// Last computed level.
    pub fn current(&self) -> f32 {
        self.last
    }

    /// Settle to silence once the session is no longer active.
    pub fn reset(&mut self) {
        self.last = 0.0;
    }
}

fn level(bins: &[u8]) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }
    let sum: u64 = bins.iter().map(|&b| b as u64).sum();
    let mean = sum as f32 / bins.len() as f32;
    (mean / NORMALIZATION).clamp(0.0, 1.0)
}
