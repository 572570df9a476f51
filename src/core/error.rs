//! Structured error handling for the synthesis core
//!
//! Provides a typed error taxonomy matching the failure classes the
//! scheduler has to tell apart: admission rejections, recoverable
//! resource exhaustion, fatal configuration problems, timeouts and
//! deliberate cancellation.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias with TtsError
pub type Result<T> = std::result::Result<T, TtsError>;

/// Main error type for the synthesis core
#[derive(Error, Debug, Clone)]
pub enum TtsError {
    /// Admission errors, rejected synchronously at submit time
    #[error("Admission rejected ({reason}): {message}")]
    Admission {
        message: String,
        reason: AdmissionReason,
    },

    /// Resource errors (no free device, out-of-memory during synthesis)
    #[error("Resource error ({kind}): {message}")]
    Resource {
        message: String,
        kind: ResourceKind,
    },

    /// Configuration errors (missing model artifact, invalid field)
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Input validation errors
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Session construction errors (model load, runtime warmup)
    #[error("Session error for '{key}': {message}")]
    Session {
        message: String,
        key: String,
    },

    /// Synthesis errors raised by the inference runtime
    #[error("Synthesis error in chunk {chunk_index}: {message}")]
    Synthesis {
        message: String,
        chunk_index: usize,
        /// Whether the runtime reported an exhaustion-class condition
        exhausted: bool,
    },

    /// Text processing errors
    #[error("Text processing error ({operation}): {message}")]
    Text {
        message: String,
        operation: TextOperation,
    },

    /// Audio processing errors
    #[error("Audio processing error ({operation}): {message}")]
    Audio {
        message: String,
        operation: AudioOperation,
    },

    /// Per-job timeout; terminal, never retried
    #[error("Operation timeout: {message} ({duration_ms}ms)")]
    Timeout {
        message: String,
        duration_ms: u64,
    },

    /// Cancellation is a deliberate terminal state, not a failure
    #[error("Job {job_id} cancelled")]
    Cancelled { job_id: String },

    /// I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    /// Internal/bug errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Why a submission was rejected before entering the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionReason {
    /// Client exceeded its per-minute request cap
    RateLimited,
    /// Total job count reached the queue bound
    QueueFull,
}

impl fmt::Display for AdmissionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionReason::RateLimited => write!(f, "rate limited"),
            AdmissionReason::QueueFull => write!(f, "queue full"),
        }
    }
}

/// Resource classes tracked by the device manager and cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Device,
    Memory,
    Session,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Device => write!(f, "device"),
            ResourceKind::Memory => write!(f, "memory"),
            ResourceKind::Session => write!(f, "session"),
        }
    }
}

/// Text operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextOperation {
    Cleaning,
    Analysis,
    Segmentation,
}

impl fmt::Display for TextOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextOperation::Cleaning => write!(f, "cleaning"),
            TextOperation::Analysis => write!(f, "analysis"),
            TextOperation::Segmentation => write!(f, "segmentation"),
        }
    }
}

/// Audio operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioOperation {
    Normalization,
    Crossfade,
    Concatenation,
    Encoding,
}

impl fmt::Display for AudioOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioOperation::Normalization => write!(f, "normalization"),
            AudioOperation::Crossfade => write!(f, "crossfade"),
            AudioOperation::Concatenation => write!(f, "concatenation"),
            AudioOperation::Encoding => write!(f, "encoding"),
        }
    }
}

impl TtsError {
    /// Whether this error belongs to the resource-exhaustion class.
    ///
    /// Only the scheduler's worker loop and the pipeline's documented
    /// silence fallback consult this; lower components never classify.
    pub fn is_resource_exhaustion(&self) -> bool {
        match self {
            TtsError::Resource { .. } => true,
            TtsError::Synthesis { exhausted, .. } => *exhausted,
            _ => false,
        }
    }

    /// Whether this error is terminal regardless of remaining retries
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TtsError::Config { .. }
                | TtsError::Validation { .. }
                | TtsError::Timeout { .. }
                | TtsError::Cancelled { .. }
        )
    }
}

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    /// Add a simple message context
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| TtsError::Internal {
            message: format!("{}: {}", f(), e),
        })
    }

    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| TtsError::Internal {
            message: format!("{}: {}", msg.into(), e),
        })
    }
}

impl From<anyhow::Error> for TtsError {
    fn from(err: anyhow::Error) -> Self {
        TtsError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for TtsError {
    fn from(err: std::io::Error) -> Self {
        TtsError::Io {
            message: err.to_string(),
            path: None,
        }
    }
}
