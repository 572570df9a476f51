//! Job records and their state machine
//!
//! `pending → queued → processing → {completed | failed | cancelled}`,
//! with `failed → queued` while retries remain. Once a result is set
//! the status is terminal and the record is never mutated again.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::core::metrics::StageTimings;
use crate::engine::AudioBuffer;
use crate::resource::DeviceId;
use crate::synthesis::{SynthesisRequest, SynthesisStats};

/// Unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a fresh id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind of synthesis work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobKind {
    /// Short conversational synthesis with a stock voice
    InteractiveVoice,
    /// Long-form synthesis conditioned on reference audio
    VoiceCloning,
}

/// Dispatch priority; higher runs first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum JobPriority {
    Low,
    Normal,
    High,
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether the state admits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Live progress of a processing job
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobProgress {
    /// Fraction complete in [0, 1]
    pub fraction: f32,
    /// Current pipeline stage
    pub stage: String,
}

/// Final result of a job
#[derive(Debug, Clone)]
pub struct JobResult {
    /// Whether synthesis succeeded (possibly degraded)
    pub success: bool,
    /// The stitched waveform on success
    pub audio: Option<AudioBuffer>,
    /// Error message on failure
    pub error: Option<String>,
    /// Generation statistics on success
    pub stats: Option<SynthesisStats>,
}

/// One unit of synthesis work
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique id
    pub id: JobId,
    /// Work kind
    pub kind: JobKind,
    /// Immutable request payload
    pub request: Arc<SynthesisRequest>,
    /// Lifecycle state
    pub status: JobStatus,
    /// Dispatch priority
    pub priority: JobPriority,
    /// Submitting client
    pub client_id: String,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// Processing start time
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time
    pub completed_at: Option<DateTime<Utc>>,
    /// Live progress
    pub progress: JobProgress,
    /// Final result; set exactly once
    pub result: Option<JobResult>,
    /// Retries consumed
    pub retries: u32,
    /// Retry budget for resource-class failures
    pub max_retries: u32,
    /// Worker currently executing the job
    pub worker_id: Option<usize>,
    /// Device allocated to the job
    pub device_id: Option<DeviceId>,
    /// Human-readable status message
    pub message: String,
}

impl Job {
    /// Create a pending job
    pub fn new(
        kind: JobKind,
        request: Arc<SynthesisRequest>,
        priority: JobPriority,
        client_id: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            id: JobId::new(),
            kind,
            request,
            status: JobStatus::Pending,
            priority,
            client_id: client_id.into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: JobProgress::default(),
            result: None,
            retries: 0,
            max_retries,
            worker_id: None,
            device_id: None,
            message: "pending".to_string(),
        }
    }

    /// Whether the record may still change
    fn mutable(&self) -> bool {
        self.result.is_none() && !self.status.is_terminal()
    }

    /// `pending → queued`, or `failed → queued` on retry
    pub fn mark_queued(&mut self) {
        if !self.mutable() {
            return;
        }
        self.status = JobStatus::Queued;
        self.message = if self.retries > 0 {
            format!("queued (retry {}/{})", self.retries, self.max_retries)
        } else {
            "queued".to_string()
        };
    }

    /// `queued → processing`
    pub fn mark_processing(&mut self, worker_id: usize) {
        if !self.mutable() {
            return;
        }
        self.status = JobStatus::Processing;
        self.started_at = Some(Utc::now());
        self.worker_id = Some(worker_id);
        self.message = "processing".to_string();
    }

    /// Terminal: success (possibly with degraded chunks)
    pub fn mark_completed(&mut self, audio: AudioBuffer, stats: SynthesisStats) {
        if !self.mutable() {
            return;
        }
        self.message = if stats.degraded_chunks > 0 {
            format!("completed with {} degraded chunk(s)", stats.degraded_chunks)
        } else {
            "completed".to_string()
        };
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.progress = JobProgress {
            fraction: 1.0,
            stage: "done".to_string(),
        };
        self.result = Some(JobResult {
            success: true,
            audio: Some(audio),
            error: None,
            stats: Some(stats),
        });
    }

    /// Terminal: failure with retries exhausted or a fatal error
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        if !self.mutable() {
            return;
        }
        let error = error.into();
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.message = error.clone();
        self.result = Some(JobResult {
            success: false,
            audio: None,
            error: Some(error),
            stats: None,
        });
    }

    /// Terminal: cancelled before dispatch
    pub fn mark_cancelled(&mut self) {
        if !self.mutable() {
            return;
        }
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.message = "cancelled".to_string();
        self.result = Some(JobResult {
            success: false,
            audio: None,
            error: None,
            stats: None,
        });
    }

    /// Failed transiently with retry budget left: back to the queue
    pub fn mark_retrying(&mut self, reason: &str) {
        if !self.mutable() {
            return;
        }
        self.retries += 1;
        self.worker_id = None;
        self.device_id = None;
        self.message = format!("retrying after: {}", reason);
        self.status = JobStatus::Queued;
    }

    /// Cancellation only succeeds before processing starts
    pub fn can_cancel(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Queued)
    }

    /// External view of the record; audio stays behind a separate
    /// accessor so polling never copies waveforms
    pub fn view(&self) -> JobView {
        let stats = self.result.as_ref().and_then(|r| r.stats.clone());
        JobView {
            id: self.id,
            kind: self.kind,
            status: self.status,
            priority: self.priority,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            progress: self.progress.clone(),
            message: self.message.clone(),
            error: self.result.as_ref().and_then(|r| r.error.clone()),
            retries: self.retries,
            chunk_count: stats.as_ref().map(|s| s.chunk_count),
            chunking_used: stats.as_ref().map(|s| s.chunking_used),
            reference_matched: stats.as_ref().map(|s| s.reference_matched),
            degraded_chunks: stats.as_ref().map(|s| s.degraded_chunks),
            audio_secs: stats.as_ref().map(|s| s.audio_secs),
            timings: stats.map(|s| s.timings),
        }
    }
}

/// Serializable job snapshot for the polling API layer
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: JobProgress,
    pub message: String,
    pub error: Option<String>,
    pub retries: u32,
    pub chunk_count: Option<usize>,
    pub chunking_used: Option<bool>,
    pub reference_matched: Option<bool>,
    pub degraded_chunks: Option<usize>,
    pub audio_secs: Option<f32>,
    pub timings: Option<StageTimings>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::OUTPUT_SAMPLE_RATE;

    fn job() -> Job {
        Job::new(
            JobKind::InteractiveVoice,
            Arc::new(SynthesisRequest::new("hello", "en")),
            JobPriority::Normal,
            "client-1",
            2,
        )
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut job = job();
        assert_eq!(job.status, JobStatus::Pending);

        job.mark_queued();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.can_cancel());

        job.mark_processing(3);
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.worker_id, Some(3));
        assert!(!job.can_cancel());

        job.mark_completed(
            AudioBuffer::silence(0.1, OUTPUT_SAMPLE_RATE),
            SynthesisStats::default(),
        );
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.status.is_terminal());
    }

    #[test]
    fn test_terminal_record_is_immutable() {
        let mut job = job();
        job.mark_queued();
        job.mark_processing(0);
        job.mark_failed("device fault");

        let completed_at = job.completed_at;
        job.mark_queued();
        job.mark_completed(
            AudioBuffer::silence(0.1, OUTPUT_SAMPLE_RATE),
            SynthesisStats::default(),
        );

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.completed_at, completed_at);
        assert!(!job.result.as_ref().unwrap().success);
    }

    #[test]
    fn test_retry_requeues() {
        let mut job = job();
        job.mark_queued();
        job.mark_processing(0);
        job.mark_retrying("no free device");

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retries, 1);
        assert!(job.result.is_none());
        assert!(job.worker_id.is_none());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
    }

    #[test]
    fn test_view_reports_degraded_chunks() {
        let mut job = job();
        job.mark_queued();
        job.mark_processing(0);
        job.mark_completed(
            AudioBuffer::silence(0.1, OUTPUT_SAMPLE_RATE),
            SynthesisStats {
                chunk_count: 4,
                degraded_chunks: 1,
                ..Default::default()
            },
        );

        let view = job.view();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.degraded_chunks, Some(1));
        assert!(view.message.contains("degraded"));
    }
}
