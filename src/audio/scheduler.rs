//! Gapless playback scheduling
//!
//! The scheduler owns the playback cursor: the device-clock time at which the
//! next buffer must begin. Buffers queued while earlier ones are still playing
//! start exactly when their predecessor ends. Buffers that arrive after a gap
//! start immediately.

use super::codec::AudioFrame;
use super::playback::{OutputDevice, SegmentId};

/// Default window used to decide that nothing further is queued (seconds)
pub const DEFAULT_DRAIN_EPSILON: f64 = 0.1;

/// Placement of a scheduled frame on the device timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSegment {
    pub id: SegmentId,
    /// Device time the segment starts
    pub start: f64,
    /// Device time the segment ends
    pub end: f64,
}

/// Schedules decoded frames back-to-back on an output device
pub struct PlaybackScheduler<O> {
    output: O,
    cursor: f64,
    next_id: u64,
    epsilon: f64,
}

impl<O: OutputDevice> PlaybackScheduler<O> {
    /// Create a scheduler whose cursor starts at the device's current time
    pub fn new(output: O) -> Self {
        Self::with_epsilon(output, DEFAULT_DRAIN_EPSILON)
    }

    /// Create a scheduler with a custom drain window
    pub fn with_epsilon(output: O, epsilon: f64) -> Self {
        let cursor = output.current_time();
        Self {
            output,
            cursor,
            next_id: 0,
            epsilon,
        }
    }

    /// Schedule a frame to start at `max(cursor, now)` and advance the cursor
    pub fn schedule(&mut self, frame: AudioFrame) -> ScheduledSegment {
        let now = self.output.current_time();
        let start = self.cursor.max(now);
        let end = start + frame.duration();

        self.next_id += 1;
        let id = SegmentId(self.next_id);

        tracing::trace!(
            segment = id.0,
            start,
            end,
            samples = frame.len(),
            late = now > self.cursor,
            "scheduling playback segment"
        );

        self.output.start_at(id, frame, start);
        self.cursor = end;

        ScheduledSegment { id, start, end }
    }

    /// Stop current playback and discard everything queued
    ///
    /// The cursor snaps to the device's current time so post-interruption
    /// audio starts immediately. Returns the number of discarded segments.
    pub fn interrupt(&mut self) -> usize {
        let discarded = self.output.stop_all();
        self.cursor = self.output.current_time();
        tracing::debug!(discarded, cursor = self.cursor, "playback interrupted");
        discarded
    }

    /// Teardown variant of [`Self::interrupt`]
    pub fn reset(&mut self) {
        let discarded = self.output.stop_all();
        self.cursor = self.output.current_time();
        if discarded > 0 {
            tracing::debug!(discarded, "playback reset");
        }
    }

    /// Whether a segment ending at `at` leaves nothing else queued within epsilon
    #[must_use]
    pub fn is_drained(&self, at: f64) -> bool {
        at >= self.cursor - self.epsilon
    }

    /// Device time at which the next scheduled frame would begin
    #[must_use]
    pub const fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Current output-device time
    #[must_use]
    pub fn current_time(&self) -> f64 {
        self.output.current_time()
    }

    /// Output sample rate frames must be decoded to
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.output.sample_rate()
    }

    /// Borrow the underlying device
    #[must_use]
    pub const fn output(&self) -> &O {
        &self.output
    }
}
