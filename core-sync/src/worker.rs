//! # Worker Pool
//!
//! A fixed set of workers fed by a single dispatcher.
//!
//! ## Architecture
//!
//! ```text
//! CreateJob ──► job queue ──► dispatcher ──► idle worker slot ──► worker
//!                                  ▲                                │
//!                                  └──── worker registers again ◄───┘
//! ```
//!
//! Each idle worker registers a one-shot slot in a shared pool channel and
//! waits on it. The dispatcher takes the next queued job, then the next idle
//! slot, and hands the job over. A worker therefore runs at most one job at a
//! time and the pool never runs more than `worker_count` jobs.
//!
//! The processor runs in its own task under the per-job deadline; a panic or
//! a timeout is recorded as a job failure and never takes the worker down.

use crate::processor::{JobContext, ProcessorRegistry, ProgressReporter};
use crate::repository::JobOutcome;
use crate::{Job, JobId, JobRepository, SyncError};
use bridge_traits::time::Clock;
use core_runtime::events::{CoreEvent, EventBus, JobEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

struct ActiveJob {
    cancel: CancellationToken,
    task: Option<AbortHandle>,
}

/// Jobs currently executing in this process.
#[derive(Clone, Default)]
pub(crate) struct ActiveJobs {
    jobs: Arc<Mutex<HashMap<JobId, ActiveJob>>>,
}

impl ActiveJobs {
    pub(crate) async fn insert(&self, id: JobId, cancel: CancellationToken) {
        self.jobs
            .lock()
            .await
            .insert(id, ActiveJob { cancel, task: None });
    }

    /// Remember the processor task so a stalled shutdown can abort it.
    pub(crate) async fn attach_task(&self, id: &JobId, task: AbortHandle) {
        if let Some(job) = self.jobs.lock().await.get_mut(id) {
            job.task = Some(task);
        }
    }

    pub(crate) async fn remove(&self, id: &JobId) {
        self.jobs.lock().await.remove(id);
    }

    /// Cancel a running job's token. Returns false if it is not running here.
    pub(crate) async fn cancel(&self, id: &JobId) -> bool {
        match self.jobs.lock().await.get(id) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Abort every processor task still executing. Returns how many were hit.
    pub(crate) async fn abort_all(&self) -> usize {
        let jobs = self.jobs.lock().await;
        for job in jobs.values() {
            job.cancel.cancel();
            if let Some(task) = &job.task {
                task.abort();
            }
        }
        jobs.len()
    }

    pub(crate) async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

/// Everything a worker needs, shared by the whole pool.
pub(crate) struct WorkerShared {
    pub(crate) repository: Arc<dyn JobRepository>,
    pub(crate) registry: ProcessorRegistry,
    pub(crate) events: EventBus,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) active: ActiveJobs,
    pub(crate) job_timeout: Duration,
}

pub(crate) type WorkerSlot = oneshot::Sender<JobId>;

// ============================================================================
// Dispatcher
// ============================================================================

/// Hand queued jobs to idle workers until shutdown.
pub(crate) async fn run_dispatcher(
    mut queue: mpsc::Receiver<JobId>,
    mut idle_workers: mpsc::Receiver<WorkerSlot>,
    shutdown: CancellationToken,
) {
    debug!("Dispatcher started");

    'dispatch: loop {
        let job_id = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = queue.recv() => match job {
                Some(job_id) => job_id,
                None => break,
            },
        };

        let mut job_id = job_id;
        loop {
            let slot = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break 'dispatch,
                slot = idle_workers.recv() => match slot {
                    Some(slot) => slot,
                    None => break 'dispatch,
                },
            };

            // A slot whose worker has exited hands the job back.
            match slot.send(job_id) {
                Ok(()) => break,
                Err(returned) => job_id = returned,
            }
        }
    }

    debug!("Dispatcher stopped");
}

// ============================================================================
// Worker
// ============================================================================

pub(crate) struct Worker {
    id: usize,
    shared: Arc<WorkerShared>,
    pool: mpsc::Sender<WorkerSlot>,
    shutdown: CancellationToken,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        shared: Arc<WorkerShared>,
        pool: mpsc::Sender<WorkerSlot>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            shared,
            pool,
            shutdown,
        }
    }

    pub(crate) async fn run(self) {
        debug!(worker_id = self.id, "Worker started");

        loop {
            let (slot, assigned) = oneshot::channel();
            if self.pool.send(slot).await.is_err() {
                break;
            }

            let job_id = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                job = assigned => match job {
                    Ok(job_id) => job_id,
                    Err(_) => break,
                },
            };

            self.execute(job_id).await;
        }

        debug!(worker_id = self.id, "Worker stopped");
    }

    #[instrument(skip(self), fields(worker_id = self.id, job_id = %job_id))]
    async fn execute(&self, job_id: JobId) {
        let shared = &self.shared;

        let job = match shared
            .repository
            .mark_running(&job_id, shared.clock.unix_timestamp())
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!("Job is no longer pending, skipping");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to claim job");
                return;
            }
        };

        info!(job_type = %job.job_type, "Job started");
        shared.events.publish(CoreEvent::Job(JobEvent::Started {
            job_id: job_id.to_string(),
            worker_id: self.id,
        }));

        let Some(processor) = shared.registry.get(job.job_type) else {
            let message = format!("No processor registered for job type {}", job.job_type);
            self.record_outcome(&job, JobOutcome::Failed(message)).await;
            return;
        };

        let cancel = self.shutdown.child_token();
        shared.active.insert(job_id, cancel.clone()).await;

        let ctx = JobContext::new(
            cancel.clone(),
            ProgressReporter::new(
                job_id,
                shared.repository.clone(),
                shared.events.clone(),
                shared.clock.clone(),
            ),
            shared.events.clone(),
        );

        let task = tokio::spawn({
            let job = job.clone();
            async move { processor.process(&job, &ctx).await }
        });
        let abort = task.abort_handle();
        shared.active.attach_task(&job_id, abort.clone()).await;

        let outcome = match tokio::time::timeout(shared.job_timeout, task).await {
            Ok(Ok(Ok(counters))) => Some(JobOutcome::Completed(counters)),
            Ok(Ok(Err(e))) if e.is_cancelled() => {
                if self.shutdown.is_cancelled() {
                    info!("Job interrupted by shutdown, left running for resume");
                } else {
                    info!("Job stopped after cancellation");
                }
                None
            }
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "Job failed");
                Some(JobOutcome::Failed(e.to_string()))
            }
            Ok(Err(join_error)) if join_error.is_cancelled() && self.shutdown.is_cancelled() => {
                info!("Job aborted by shutdown, left running for resume");
                None
            }
            Ok(Err(join_error)) => {
                error!(error = %join_error, "Job processor panicked");
                Some(JobOutcome::Failed(format!(
                    "Processor crashed: {}",
                    join_error
                )))
            }
            Err(_) => {
                cancel.cancel();
                abort.abort();
                let err = SyncError::Timeout(shared.job_timeout.as_secs());
                warn!(error = %err, "Job exceeded its deadline");
                Some(JobOutcome::Failed(err.to_string()))
            }
        };

        shared.active.remove(&job_id).await;

        if let Some(outcome) = outcome {
            self.record_outcome(&job, outcome).await;
        }
    }

    async fn record_outcome(&self, job: &Job, outcome: JobOutcome) {
        let shared = &self.shared;

        if let Err(e) = job.status.validate_transition(outcome.status()) {
            error!(error = %e, "Refusing to record job outcome");
            return;
        }

        let now = shared.clock.unix_timestamp();
        let finished = match shared.repository.finish(&job.id, &outcome, now).await {
            Ok(Some(finished)) => finished,
            Ok(None) => {
                debug!("Job left running state meanwhile, outcome discarded");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to record job outcome");
                return;
            }
        };

        let event = match outcome {
            JobOutcome::Completed(counters) => {
                info!(
                    successful = counters.successful,
                    failed = counters.failed,
                    "Job completed"
                );
                JobEvent::Completed {
                    job_id: job.id.to_string(),
                    successful: counters.successful,
                    failed: counters.failed,
                    duration_secs: finished.duration_secs().unwrap_or_default(),
                }
            }
            JobOutcome::Failed(message) => JobEvent::Failed {
                job_id: job.id.to_string(),
                message,
            },
        };
        shared.events.publish(CoreEvent::Job(event));
    }
}
