//! # Longform-TTS — Long-form Speech Synthesis Orchestration
//!
//! Turns arbitrarily long text requests into single coherent waveforms
//! while sharing a small number of GPUs across many concurrent
//! clients.
//!
//! ## Features
//!
//! - **Priority Scheduling**: admission control, per-client rate
//!   limits and a bounded worker pool over a priority queue
//! - **Device Management**: load-balanced GPU allocation with stale
//!   reclamation and CPU fallback
//! - **Warm Model Cache**: single-flight session construction, LRU
//!   eviction and idle sweeps
//! - **Semantic Chunking**: sentence/clause-aware splitting sized to
//!   the model's context budget, with reference-length matching for
//!   voice cloning
//! - **Seamless Stitching**: RMS normalization, adaptive crossfades
//!   and seam smoothing so chunked output sounds like one voice
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use longform_tts::{
//!     JobKind, JobPriority, JobScheduler, ModelArtifact, SynthesisRequest, TtsConfig,
//! };
//!
//! let scheduler = JobScheduler::new(
//!     TtsConfig::default(),
//!     runtime,                                  // your InferenceRuntime
//!     ModelArtifact::new("/models/tts", "base"),
//!     &probe,                                   // your DeviceProbe
//! )?;
//! scheduler.start();
//!
//! let id = scheduler.submit(
//!     JobKind::InteractiveVoice,
//!     SynthesisRequest::new("Hello world", "en"),
//!     JobPriority::Normal,
//!     "client-1",
//! )?;
//!
//! // Poll until terminal, then fetch the waveform.
//! let view = scheduler.status(id).unwrap();
//! let audio = scheduler.result_audio(id);
//! ```
//!
//! The neural runtime itself is a collaborator behind the
//! [`engine::InferenceRuntime`] trait; this crate never interprets
//! model tensors beyond treating outputs as PCM sample buffers.

pub mod audio;
pub mod cache;
pub mod core;
pub mod engine;
pub mod resource;
pub mod scheduler;
pub mod synthesis;
pub mod text;
pub mod utils;
pub mod voice;

// Core framework re-exports
pub use crate::core::{
    config::{
        DeviceConfig, ModelCacheConfig, SchedulerConfig, SegmenterConfig, StitchConfig, TtsConfig,
    },
    error::{AdmissionReason, ResourceKind, Result, ResultExt, TtsError},
    metrics::{StageTimings, TimerStats},
};

// Engine seam re-exports
pub use engine::{
    AudioBuffer, DevicePreference, InferenceRuntime, InferenceSession, ModelArtifact,
    SynthesisInput, OUTPUT_SAMPLE_RATE,
};

// Component re-exports
pub use audio::{AudioStitcher, FadeCurve};
pub use cache::{ModelCache, ModelCacheStats, SessionKey};
pub use resource::{DeviceManager, DeviceProbe, DeviceRecord, DeviceSpec, DeviceStatus, StaticProbe};
pub use scheduler::{
    JobId, JobKind, JobPriority, JobScheduler, JobStatus, JobView, SchedulerStats,
};
pub use synthesis::{SynthesisOutcome, SynthesisPipeline, SynthesisRequest, SynthesisStats};
pub use text::{Chunk, ChunkType, ProsodyType, TextAnalysis, TextAnalyzer, TextSegmenter};
pub use voice::{VoiceContext, VoiceContinuityManager, VoiceParams};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
