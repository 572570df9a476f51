//! Framework-level components shared by every subsystem
//!
//! - `error`: structured error taxonomy and `Result` alias
//! - `config`: validated per-subsystem configuration structs
//! - `metrics`: timing statistics

pub mod config;
pub mod error;
pub mod metrics;

pub use config::{
    DeviceConfig, ModelCacheConfig, SchedulerConfig, SegmenterConfig, StitchConfig, TtsConfig,
};
pub use error::{
    AdmissionReason, AudioOperation, ResourceKind, Result, ResultExt, TextOperation, TtsError,
};
pub use metrics::{ScopedTimer, StageTimings, TimerStats};
