//! Per-subsystem configuration
//!
//! Each component reads exactly one struct, validated once at
//! construction. Defaults are tuned for a small multi-GPU deployment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{Result, TtsError};

/// Scheduler and worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of concurrent workers
    pub worker_count: usize,
    /// Maximum jobs held in memory (queued + running + retained)
    pub max_jobs: usize,
    /// Per-client submissions allowed per minute
    pub client_requests_per_minute: usize,
    /// Retries granted to resource-class failures
    pub max_retries: u32,
    /// Base delay for requeue backoff (doubled per retry, jittered)
    pub retry_backoff: Duration,
    /// Hard wall-clock limit per job
    pub job_timeout: Duration,
    /// How long completed job records stay queryable
    pub retention: Duration,
    /// Interval for the maintenance sweep (retention, reclaim, stats)
    pub sweep_interval: Duration,
    /// Fall back to a CPU session when no device can be allocated
    pub cpu_fallback: bool,
    /// Memory reserved per session use when allocating a device, bytes
    pub session_memory_estimate: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_jobs: 200,
            client_requests_per_minute: 30,
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
            job_timeout: Duration::from_secs(300),
            retention: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(10),
            cpu_fallback: true,
            session_memory_estimate: 2 * 1024 * 1024 * 1024,
        }
    }
}

impl SchedulerConfig {
    /// Set the worker pool size
    pub fn with_workers(mut self, n: usize) -> Self {
        self.worker_count = n;
        self
    }

    /// Set the per-job timeout
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Validate field ranges
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(TtsError::Config {
                message: "worker_count must be at least 1".to_string(),
                path: None,
            });
        }
        if self.max_jobs == 0 {
            return Err(TtsError::Config {
                message: "max_jobs must be at least 1".to_string(),
                path: None,
            });
        }
        if self.job_timeout.is_zero() {
            return Err(TtsError::Config {
                message: "job_timeout must be non-zero".to_string(),
                path: None,
            });
        }
        Ok(())
    }
}

/// Device manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Concurrent session uses allowed per device
    pub max_sessions_per_device: usize,
    /// Interval of the utilization/free-memory refresh task
    pub refresh_interval: Duration,
    /// Allocations older than this are reclaimed by the sweep
    pub max_allocation_age: Duration,
    /// Memory headroom kept free on every device, in bytes
    pub memory_headroom: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_device: 2,
            refresh_interval: Duration::from_secs(5),
            max_allocation_age: Duration::from_secs(600),
            memory_headroom: 512 * 1024 * 1024,
        }
    }
}

impl DeviceConfig {
    /// Set the per-device concurrency cap
    pub fn with_session_cap(mut self, cap: usize) -> Self {
        self.max_sessions_per_device = cap;
        self
    }

    /// Validate field ranges
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions_per_device == 0 {
            return Err(TtsError::Config {
                message: "max_sessions_per_device must be at least 1".to_string(),
                path: None,
            });
        }
        Ok(())
    }
}

/// Model cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCacheConfig {
    /// Maximum warm sessions held at once
    pub max_entries: usize,
    /// Entries idle longer than this are swept
    pub idle_timeout: Duration,
    /// Interval of the idle sweep task
    pub sweep_interval: Duration,
}

impl Default for ModelCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 4,
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl ModelCacheConfig {
    /// Set the cache size bound
    pub fn with_max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }

    /// Validate field ranges
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(TtsError::Config {
                message: "max_entries must be at least 1".to_string(),
                path: None,
            });
        }
        Ok(())
    }
}

/// Text analysis and segmentation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterConfig {
    /// Hard upper bound on chunk length in characters
    pub max_chunk_chars: usize,
    /// Texts at or below this length bypass chunking entirely
    pub chunking_threshold_chars: usize,
    /// Chunks with fewer words are merged into a neighbor when possible
    pub min_chunk_words: usize,
    /// Plain speech rate used for duration estimates, chars per second
    pub chars_per_second: f32,
    /// Pause added per sentence-ending punctuation mark, seconds
    pub sentence_pause_secs: f32,
    /// Pause added per clause punctuation mark, seconds
    pub clause_pause_secs: f32,
    /// Reference-length matching activates when target words exceed
    /// reference words by this ratio
    pub reference_ratio_threshold: f32,
    /// Allowed deviation from the reference word count (0.2 = ±20%)
    pub reference_tolerance: f32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 400,
            chunking_threshold_chars: 200,
            min_chunk_words: 4,
            chars_per_second: 15.0,
            sentence_pause_secs: 0.35,
            clause_pause_secs: 0.15,
            reference_ratio_threshold: 2.0,
            reference_tolerance: 0.2,
        }
    }
}

impl SegmenterConfig {
    /// Set the hard chunk bound
    pub fn with_max_chunk_chars(mut self, n: usize) -> Self {
        self.max_chunk_chars = n;
        self
    }

    /// Validate field ranges
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_chars == 0 {
            return Err(TtsError::Config {
                message: "max_chunk_chars must be at least 1".to_string(),
                path: None,
            });
        }
        if self.chunking_threshold_chars > self.max_chunk_chars {
            return Err(TtsError::Config {
                message: format!(
                    "chunking_threshold_chars ({}) must not exceed max_chunk_chars ({})",
                    self.chunking_threshold_chars, self.max_chunk_chars
                ),
                path: None,
            });
        }
        if self.chars_per_second <= 0.0 {
            return Err(TtsError::Config {
                message: "chars_per_second must be positive".to_string(),
                path: None,
            });
        }
        if !(0.0..1.0).contains(&self.reference_tolerance) {
            return Err(TtsError::Config {
                message: "reference_tolerance must be in [0, 1)".to_string(),
                path: None,
            });
        }
        Ok(())
    }
}

/// Audio stitching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StitchConfig {
    /// Gain clamp applied during RMS normalization
    pub min_gain: f32,
    /// Upper gain clamp
    pub max_gain: f32,
    /// Tighter clamp used at clean sentence boundaries
    pub boundary_gain_margin: f32,
    /// Longest crossfade overlap, seconds
    pub max_crossfade_secs: f32,
    /// Shortest crossfade overlap, seconds
    pub min_crossfade_secs: f32,
    /// Half-width of the seam smoothing window, samples
    pub smoothing_radius: usize,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            min_gain: 0.8,
            max_gain: 1.2,
            boundary_gain_margin: 0.1,
            max_crossfade_secs: 0.12,
            min_crossfade_secs: 0.02,
            smoothing_radius: 8,
        }
    }
}

impl StitchConfig {
    /// Validate field ranges
    pub fn validate(&self) -> Result<()> {
        if self.min_gain <= 0.0 || self.max_gain < self.min_gain {
            return Err(TtsError::Config {
                message: "gain clamp must satisfy 0 < min_gain <= max_gain".to_string(),
                path: None,
            });
        }
        if self.min_crossfade_secs < 0.0 || self.max_crossfade_secs < self.min_crossfade_secs {
            return Err(TtsError::Config {
                message: "crossfade bounds must satisfy 0 <= min <= max".to_string(),
                path: None,
            });
        }
        Ok(())
    }
}

/// Top-level configuration aggregating every subsystem
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtsConfig {
    pub scheduler: SchedulerConfig,
    pub devices: DeviceConfig,
    pub cache: ModelCacheConfig,
    pub segmenter: SegmenterConfig,
    pub stitch: StitchConfig,
}

impl TtsConfig {
    /// Validate every subsystem config
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.devices.validate()?;
        self.cache.validate()?;
        self.segmenter.validate()?;
        self.stitch.validate()?;
        Ok(())
    }
}
