//! Frames-per-second accounting for the pose loop.

use std::{fmt, time::Duration};

use tokio::time::Instant;

/// A published frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FpsEstimate {
    pub value: u32,
}

impl fmt::Display for FpsEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} FPS", self.value)
    }
}

/// Counts processed frames and periodically derives a frame rate from them.
///
/// Every `window` frames, the rate is recomputed as the number of frames processed since the
/// tracker was started, divided by the wall time elapsed since then (at millisecond resolution).
/// This is a cumulative average, not a sliding window. Between recomputations, the previously
/// published rate is retained.
#[derive(Debug, Clone)]
pub struct ThroughputTracker {
    window: u64,
    frames: u64,
    start: Instant,
    published: Option<FpsEstimate>,
}

impl ThroughputTracker {
    /// The number of frames between rate recomputations, unless configured otherwise.
    pub const DEFAULT_WINDOW: u64 = 10;

    /// Creates a tracker whose elapsed time is measured from `start`.
    ///
    /// # Panics
    ///
    /// Panics if `window` is zero.
    pub fn new(window: u64, start: Instant) -> Self {
        assert!(window > 0, "throughput window must be at least one frame");
        Self {
            window,
            frames: 0,
            start,
            published: None,
        }
    }

    /// Records a processed frame at time `now`.
    ///
    /// Returns the newly published rate if this frame completed a window.
    pub fn record_frame(&mut self, now: Instant) -> Option<FpsEstimate> {
        self.frames += 1;
        if self.frames % self.window != 0 {
            return None;
        }

        let elapsed_ms = now.saturating_duration_since(self.start).as_millis();
        if elapsed_ms == 0 {
            log::trace!("{} frames in under a millisecond, keeping previous rate", self.frames);
            return None;
        }

        let value = (self.frames as f64 * 1000.0 / elapsed_ms as f64).round() as u32;
        let estimate = FpsEstimate { value };
        self.published = Some(estimate);
        Some(estimate)
    }

    /// The last published rate, or `None` before the first full window.
    #[inline]
    pub fn fps(&self) -> Option<FpsEstimate> {
        self.published
    }

    #[inline]
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    #[inline]
    pub fn window(&self) -> u64 {
        self.window
    }

    /// Time since the tracker was started.
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start)
    }
}
