//! Job queue and scheduling
//!
//! The scheduler is the top-level orchestrator: it admits jobs under a
//! per-client rate limit and a capacity bound, dispatches them from a
//! priority queue into a bounded worker pool, tracks lifecycle and
//! progress, supports cancellation before dispatch and runs the
//! background sweeps (stale-allocation reclaim, record retention,
//! statistics refresh).

pub mod job;
pub mod queue;
mod worker;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::ModelCache;
use crate::core::config::{SchedulerConfig, TtsConfig};
use crate::core::error::{AdmissionReason, Result, TtsError};
use crate::core::metrics::TimerStats;
use crate::engine::{AudioBuffer, InferenceRuntime, ModelArtifact};
use crate::resource::{DeviceManager, DeviceProbe};
use crate::synthesis::{SynthesisPipeline, SynthesisRequest};
use crate::voice::VoiceContinuityManager;

pub use job::{Job, JobId, JobKind, JobPriority, JobProgress, JobResult, JobStatus, JobView};
pub use queue::{JobQueue, RateLimiter};

/// Aggregate scheduler statistics
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    /// Jobs waiting in the queue
    pub queue_depth: usize,
    /// Workers currently executing a job
    pub active_workers: usize,
    /// Job records currently held (all states)
    pub total_jobs: usize,
    /// Jobs completed since start
    pub completed: u64,
    /// Jobs failed since start
    pub failed: u64,
    /// Jobs cancelled since start
    pub cancelled: u64,
    /// Average processing time of completed jobs, milliseconds
    pub avg_processing_ms: f64,
}

struct Counters {
    completed: u64,
    failed: u64,
    cancelled: u64,
    processing: TimerStats,
}

/// Shared state between the facade, workers and sweeps
pub(crate) struct SchedulerCore {
    pub(crate) config: SchedulerConfig,
    pub(crate) jobs: DashMap<JobId, Job>,
    pub(crate) queue: JobQueue,
    pub(crate) limiter: RateLimiter,
    pub(crate) devices: Arc<DeviceManager>,
    pub(crate) cache: Arc<ModelCache>,
    pub(crate) runtime: Arc<dyn InferenceRuntime>,
    pub(crate) artifact: ModelArtifact,
    pub(crate) pipeline: SynthesisPipeline,
    pub(crate) active_workers: AtomicUsize,
    counters: Mutex<Counters>,
    shutdown: AtomicBool,
}

impl SchedulerCore {
    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub(crate) fn record_completion(&self, elapsed: std::time::Duration) {
        let mut counters = self.counters.lock().unwrap();
        counters.completed += 1;
        counters.processing.record(elapsed);
    }

    pub(crate) fn record_failure(&self) {
        self.counters.lock().unwrap().failed += 1;
    }
}

/// Top-level synthesis scheduler
///
/// Constructed once by the process entry point; every dependency is
/// injected explicitly so tests can run against fakes.
pub struct JobScheduler {
    core: Arc<SchedulerCore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    /// Build a scheduler over a validated configuration.
    ///
    /// Detects devices through `probe` (an empty result degrades to
    /// CPU-only mode rather than failing startup).
    pub fn new(
        config: TtsConfig,
        runtime: Arc<dyn InferenceRuntime>,
        artifact: ModelArtifact,
        probe: &dyn DeviceProbe,
    ) -> Result<Self> {
        config.validate()?;

        let devices = DeviceManager::detect(config.devices.clone(), probe);
        let cache = ModelCache::new(config.cache.clone());
        let continuity = Arc::new(VoiceContinuityManager::new());
        let pipeline = SynthesisPipeline::new(
            config.segmenter.clone(),
            config.stitch.clone(),
            continuity,
        );

        let limiter = RateLimiter::new(
            config.scheduler.client_requests_per_minute,
            Duration::from_secs(60),
        );

        Ok(Self {
            core: Arc::new(SchedulerCore {
                config: config.scheduler.clone(),
                jobs: DashMap::new(),
                queue: JobQueue::new(),
                limiter,
                devices,
                cache,
                runtime,
                artifact,
                pipeline,
                active_workers: AtomicUsize::new(0),
                counters: Mutex::new(Counters {
                    completed: 0,
                    failed: 0,
                    cancelled: 0,
                    processing: TimerStats::default(),
                }),
                shutdown: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the worker pool and the maintenance tasks
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.is_empty() {
            return;
        }

        for worker_id in 0..self.core.config.worker_count {
            tasks.push(tokio::spawn(worker::run(
                Arc::clone(&self.core),
                worker_id,
            )));
        }

        tasks.push(Arc::clone(&self.core.devices).start_refresh());
        tasks.push(Arc::clone(&self.core.cache).start_sweep());

        let core = Arc::clone(&self.core);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(core.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweep(&core);
            }
        }));

        info!(
            workers = self.core.config.worker_count,
            "scheduler started"
        );
    }

    /// Admit a job. Rejects synchronously on rate limit or capacity;
    /// admitted jobs are queued and eventually dispatched by priority
    /// then submission order.
    pub fn submit(
        &self,
        kind: JobKind,
        request: SynthesisRequest,
        priority: JobPriority,
        client_id: &str,
    ) -> Result<JobId> {
        if self.core.shutdown_requested() {
            return Err(TtsError::Internal {
                message: "scheduler is shut down".to_string(),
            });
        }

        if request.text.trim().is_empty() {
            return Err(TtsError::Validation {
                message: "empty synthesis text".to_string(),
                field: Some("text".to_string()),
            });
        }
        if kind == JobKind::VoiceCloning && request.reference.is_none() {
            return Err(TtsError::Validation {
                message: "voice cloning requires reference audio".to_string(),
                field: Some("reference".to_string()),
            });
        }

        if !self.core.limiter.check(client_id) {
            return Err(TtsError::Admission {
                message: format!(
                    "client '{}' exceeded {} requests/minute",
                    client_id, self.core.config.client_requests_per_minute
                ),
                reason: AdmissionReason::RateLimited,
            });
        }
        if self.core.jobs.len() >= self.core.config.max_jobs {
            return Err(TtsError::Admission {
                message: format!("job capacity {} reached", self.core.config.max_jobs),
                reason: AdmissionReason::QueueFull,
            });
        }

        let mut job = Job::new(
            kind,
            Arc::new(request),
            priority,
            client_id,
            self.core.config.max_retries,
        );
        job.mark_queued();
        let id = job.id;
        self.core.jobs.insert(id, job);
        self.core.queue.push(priority, id);

        debug!(job_id = %id, ?priority, "job admitted");
        Ok(id)
    }

    /// Snapshot of one job
    pub fn status(&self, id: JobId) -> Option<JobView> {
        self.core.jobs.get(&id).map(|job| job.view())
    }

    /// The completed job's waveform, if any
    pub fn result_audio(&self, id: JobId) -> Option<AudioBuffer> {
        self.core
            .jobs
            .get(&id)
            .and_then(|job| job.result.as_ref().and_then(|r| r.audio.clone()))
    }

    /// Cancel a job. Succeeds only while the job is pending or queued;
    /// a processing job runs to completion or natural failure.
    pub fn cancel(&self, id: JobId) -> bool {
        let cancelled = self
            .core
            .jobs
            .get_mut(&id)
            .map(|mut job| {
                if job.can_cancel() {
                    job.mark_cancelled();
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);

        if cancelled {
            self.core.counters.lock().unwrap().cancelled += 1;
            info!(job_id = %id, "job cancelled");
        }
        cancelled
    }

    /// Aggregate statistics
    pub fn stats(&self) -> SchedulerStats {
        let counters = self.core.counters.lock().unwrap();
        SchedulerStats {
            queue_depth: self.core.queue.len(),
            active_workers: self.core.active_workers.load(Ordering::Relaxed),
            total_jobs: self.core.jobs.len(),
            completed: counters.completed,
            failed: counters.failed,
            cancelled: counters.cancelled,
            avg_processing_ms: counters.processing.average_ms(),
        }
    }

    /// Device manager handle, for observability
    pub fn devices(&self) -> &Arc<DeviceManager> {
        &self.core.devices
    }

    /// Model cache handle, for observability
    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.core.cache
    }

    /// Run one maintenance pass immediately (also runs periodically
    /// once started)
    pub fn sweep_now(&self) {
        sweep(&self.core);
    }

    /// Stop workers and maintenance tasks. Queued jobs stay in their
    /// last recorded state; processing jobs are not interrupted
    /// mid-synthesis by anything except task teardown.
    pub fn shutdown(&self) {
        self.core.shutdown.store(true, Ordering::Relaxed);
        self.core.queue.wake_all();
        let mut tasks = self.tasks.lock().unwrap();
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("scheduler shut down");
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One maintenance pass: reclaim stale allocations, evict retained
/// records past the window, prune the rate limiter
fn sweep(core: &Arc<SchedulerCore>) {
    let reclaimed = core.devices.reclaim_stale();
    if reclaimed > 0 {
        debug!(reclaimed, "sweep reclaimed stale allocations");
    }

    let retention = chrono::Duration::from_std(core.config.retention)
        .unwrap_or_else(|_| chrono::Duration::seconds(600));
    let now = Utc::now();
    let expired: Vec<JobId> = core
        .jobs
        .iter()
        .filter(|entry| {
            entry.status.is_terminal()
                && entry
                    .completed_at
                    .is_some_and(|at| now - at > retention)
        })
        .map(|entry| entry.id)
        .collect();
    for id in &expired {
        core.jobs.remove(id);
    }
    if !expired.is_empty() {
        debug!(evicted = expired.len(), "sweep evicted retained jobs");
    }

    core.limiter.prune();
}
