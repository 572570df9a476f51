//! Worker loop
//!
//! Each worker pulls the highest-priority ready job, allocates a
//! device (or falls back to CPU), fetches a warm session through the
//! cache and runs the pipeline under the per-job timeout. Error
//! classification lives here and nowhere else: resource exhaustion
//! requeues with jittered backoff while retries remain, timeouts and
//! everything else are terminal. The device allocation is released in
//! a guaranteed cleanup step whatever the outcome.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::SessionKey;
use crate::core::error::{ResourceKind, Result, TtsError};
use crate::engine::DevicePreference;
use crate::synthesis::{ProgressFn, SynthesisOutcome};

use super::job::{JobId, JobProgress, JobStatus};
use super::SchedulerCore;

/// Worker task body; runs until shutdown
pub(crate) async fn run(core: Arc<SchedulerCore>, worker_id: usize) {
    debug!(worker_id, "worker started");
    loop {
        if core.shutdown_requested() {
            break;
        }

        let Some(job_id) = core.queue.pop() else {
            core.queue.wait().await;
            continue;
        };

        // Claim the job; anything not queued anymore (cancelled while
        // waiting, already claimed) is simply never dispatched.
        let claimed = core
            .jobs
            .get_mut(&job_id)
            .map(|mut job| {
                if job.status == JobStatus::Queued {
                    job.mark_processing(worker_id);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if !claimed {
            continue;
        }

        core.active_workers.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let outcome = execute(&core, job_id).await;

        // Guaranteed cleanup regardless of outcome.
        core.devices.release(&job_id.to_string());
        core.active_workers.fetch_sub(1, Ordering::Relaxed);

        settle(&core, job_id, outcome, started);
    }
    debug!(worker_id, "worker stopped");
}

/// Run one claimed job through allocation, session lookup and the
/// synthesis pipeline
async fn execute(core: &Arc<SchedulerCore>, job_id: JobId) -> Result<SynthesisOutcome> {
    let request = core
        .jobs
        .get(&job_id)
        .map(|job| Arc::clone(&job.request))
        .ok_or_else(|| TtsError::Internal {
            message: format!("job {} vanished before execution", job_id),
        })?;

    let use_id = job_id.to_string();
    let allocated = core.devices.allocate(
        &use_id,
        core.config.session_memory_estimate,
        core.config.job_timeout,
    );

    let device = match allocated {
        Some(id) => {
            if let Some(mut job) = core.jobs.get_mut(&job_id) {
                job.device_id = Some(id);
            }
            DevicePreference::Gpu(id)
        }
        // No accelerators at all: permanent CPU-only mode.
        None if !core.devices.has_devices() => DevicePreference::Cpu,
        None if core.config.cpu_fallback => {
            debug!(%job_id, "no free device, falling back to CPU");
            DevicePreference::Cpu
        }
        None => {
            return Err(TtsError::Resource {
                message: "no free device".to_string(),
                kind: ResourceKind::Device,
            });
        }
    };

    let key = SessionKey::new(request.language.as_str(), device, core.artifact.clone());
    let session = core.cache.get_or_create(&key, core.runtime.as_ref()).await?;

    let progress: ProgressFn = {
        let core = Arc::clone(core);
        Arc::new(move |fraction, stage| {
            if let Some(mut job) = core.jobs.get_mut(&job_id) {
                job.progress = JobProgress {
                    fraction,
                    stage: stage.to_string(),
                };
            }
        })
    };

    match tokio::time::timeout(
        core.config.job_timeout,
        core.pipeline.run(&request, session, Some(progress)),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(TtsError::Timeout {
            message: format!("job {} exceeded the per-job limit", job_id),
            duration_ms: core.config.job_timeout.as_millis() as u64,
        }),
    }
}

/// Classify the outcome: complete, requeue with backoff, or fail
fn settle(
    core: &Arc<SchedulerCore>,
    job_id: JobId,
    outcome: Result<SynthesisOutcome>,
    started: Instant,
) {
    match outcome {
        Ok(result) => {
            if let Some(mut job) = core.jobs.get_mut(&job_id) {
                job.mark_completed(result.audio, result.stats);
            }
            core.record_completion(started.elapsed());
            info!(%job_id, "job completed");
        }
        Err(err) => {
            let retryable = err.is_resource_exhaustion() && !err.is_fatal();
            let retry_state = core.jobs.get(&job_id).map(|job| {
                (
                    job.retries,
                    job.max_retries,
                    job.priority,
                )
            });
            let Some((retries, max_retries, priority)) = retry_state else {
                return;
            };

            if retryable && retries < max_retries {
                if let Some(mut job) = core.jobs.get_mut(&job_id) {
                    job.mark_retrying(&err.to_string());
                }
                let delay = backoff_delay(core.config.retry_backoff, retries);
                warn!(%job_id, retry = retries + 1, ?delay, error = %err, "requeueing job");

                let core = Arc::clone(core);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if core.shutdown_requested() {
                        return;
                    }
                    // Still queued means not cancelled in the meantime.
                    let requeue = core
                        .jobs
                        .get(&job_id)
                        .is_some_and(|job| job.status == JobStatus::Queued);
                    if requeue {
                        core.queue.push(priority, job_id);
                    }
                });
            } else {
                if let Some(mut job) = core.jobs.get_mut(&job_id) {
                    job.mark_failed(err.to_string());
                }
                core.record_failure();
                warn!(%job_id, error = %err, "job failed");
            }
        }
    }
}

/// Exponential backoff with jitter
fn backoff_delay(base: Duration, retries: u32) -> Duration {
    let scaled = base.saturating_mul(1u32 << retries.min(8));
    let jitter_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 2).max(1));
    scaled + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_with_retries() {
        let base = Duration::from_millis(100);
        let first = backoff_delay(base, 0);
        let third = backoff_delay(base, 2);
        assert!(first >= base);
        assert!(third >= Duration::from_millis(400));
    }
}
