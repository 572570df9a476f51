//! Timing statistics for the synthesis pipeline and scheduler

use std::time::{Duration, Instant};

use serde::Serialize;

/// Running statistics for one timed operation
#[derive(Debug, Clone)]
pub struct TimerStats {
    /// Total count of measurements
    pub count: u64,
    /// Total duration
    pub total: Duration,
    /// Minimum duration
    pub min: Duration,
    /// Maximum duration
    pub max: Duration,
    /// Last duration
    pub last: Duration,
}

impl Default for TimerStats {
    fn default() -> Self {
        Self {
            count: 0,
            total: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
            last: Duration::ZERO,
        }
    }
}

impl TimerStats {
    /// Add a new measurement
    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total += duration;
        self.min = self.min.min(duration);
        self.max = self.max.max(duration);
        self.last = duration;
    }

    /// Average duration across measurements
    pub fn average(&self) -> Duration {
        if self.count > 0 {
            self.total / self.count as u32
        } else {
            Duration::ZERO
        }
    }

    /// Average in milliseconds
    pub fn average_ms(&self) -> f64 {
        self.average().as_secs_f64() * 1000.0
    }
}

/// Per-stage wall-clock timing for one completed job
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageTimings {
    /// Text analysis time in milliseconds
    pub analysis_ms: u64,
    /// Segmentation time in milliseconds
    pub segmentation_ms: u64,
    /// Total synthesis time across chunks in milliseconds
    pub synthesis_ms: u64,
    /// Stitching time in milliseconds
    pub stitch_ms: u64,
}

impl StageTimings {
    /// Total pipeline time in milliseconds
    pub fn total_ms(&self) -> u64 {
        self.analysis_ms + self.segmentation_ms + self.synthesis_ms + self.stitch_ms
    }
}

/// Scoped timer that measures into a callback on drop
pub struct ScopedTimer {
    start: Instant,
}

impl ScopedTimer {
    /// Start a new timer
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed milliseconds since start
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
