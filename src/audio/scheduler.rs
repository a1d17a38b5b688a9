//! # Playback Scheduler
//!
//! Places decoded segments on a single output timeline with no gap and no overlap.
//!
//! ## Timeline Cursor:
//! The cursor marks when the next segment may start. For each segment:
//! `start = max(device_now, cursor)` and then `cursor = start + duration`.
//! The cursor only moves forward; `reset` is the one place it returns to zero.
//!
//! ## Audible Flag:
//! Raised on every enqueue. Lowered by the completion policy once the queue looks
//! drained. Completion notifications can arrive interleaved with newer enqueues in
//! any order, so neither policy assumes ordering.

use crate::audio::device::{AudioOutput, DeviceError};
use crate::audio::pcm::PlaybackBuffer;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default tolerance for the epsilon drain check, in seconds.
pub const DEFAULT_DRAIN_EPSILON: f64 = 0.1;

/// How the scheduler decides that playback has gone quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// Quiet once `now >= cursor - epsilon`. Can flicker between back-to-back
    /// segments or linger slightly; accepted for the indicator.
    #[default]
    Epsilon,
    /// Quiet exactly when every scheduled segment has reported completion.
    Counted,
}

/// Where a segment landed on the timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSegment {
    pub id: u64,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug)]
pub struct PlaybackScheduler {
    cursor: f64,
    audible: bool,
    next_id: u64,
    outstanding: usize,
    policy: DrainPolicy,
    epsilon: f64,
}

impl PlaybackScheduler {
    pub fn new(policy: DrainPolicy, epsilon: f64) -> Self {
        Self {
            cursor: 0.0,
            audible: false,
            next_id: 0,
            outstanding: 0,
            policy,
            epsilon,
        }
    }

    #[cfg(test)]
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn is_audible(&self) -> bool {
        self.audible
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Schedule a segment right after everything already queued.
    pub fn enqueue(
        &mut self,
        output: &mut dyn AudioOutput,
        segment: PlaybackBuffer,
    ) -> Result<ScheduledSegment, DeviceError> {
        let now = output.current_time();
        let start = now.max(self.cursor);
        let duration = segment.duration();
        let id = self.next_id;

        output.schedule(segment, start, id)?;

        self.next_id += 1;
        self.cursor = start + duration;
        self.outstanding += 1;
        self.audible = true;

        debug!(id, start, duration, cursor = self.cursor, "Segment scheduled");
        Ok(ScheduledSegment {
            id,
            start,
            end: self.cursor,
        })
    }

    /// Apply the drain policy for one completion notification.
    ///
    /// Returns the audible flag after the update.
    pub fn on_complete(&mut self, now: f64) -> bool {
        self.outstanding = self.outstanding.saturating_sub(1);

        let drained = match self.policy {
            DrainPolicy::Epsilon => now >= self.cursor - self.epsilon,
            DrainPolicy::Counted => self.outstanding == 0,
        };
        if drained {
            self.audible = false;
        }
        self.audible
    }

    /// Forget all pending playback. Used when the output device is (re)acquired
    /// and on session teardown.
    pub fn reset(&mut self) {
        self.cursor = 0.0;
        self.audible = false;
        self.outstanding = 0;
    }
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new(DrainPolicy::Epsilon, DEFAULT_DRAIN_EPSILON)
    }
}
