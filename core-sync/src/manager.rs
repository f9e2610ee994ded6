//! # Job Manager
//!
//! The single entry point for creating, inspecting and cancelling jobs, and
//! the owner of the worker pool's lifecycle.
//!
//! ## Overview
//!
//! - `create_job` persists a pending row first, then offers it to the bounded
//!   dispatch queue. A queue that stays full for `enqueue_timeout` fails the
//!   job on the spot.
//! - `start` resets every job a previous process left pending or running,
//!   spawns the workers and the dispatcher, then queues the reset jobs.
//! - `stop` cancels in-flight work and waits for the pool to drain, aborting
//!   whatever outlives the shutdown grace. Jobs interrupted this way stay
//!   `running` and are resumed by the next `start`.
//!
//! One manager is built at startup and shared by reference; there is no
//! global instance.

use crate::processor::{ProcessorRegistry, ProgressReporter};
use crate::worker::{run_dispatcher, ActiveJobs, Worker, WorkerShared};
use crate::{Job, JobId, JobRepository, JobStatus, JobType, ProgressUpdate, Result, SyncError};
use bridge_traits::time::Clock;
use bridge_traits::OwnerId;
use core_runtime::config::JobConfig;
use core_runtime::events::{CoreEvent, EventBus, JobEvent};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const QUEUE_FULL_MESSAGE: &str = "Job queue is full";

/// Handles of a started pool.
struct RunningPool {
    queue: mpsc::Sender<JobId>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct JobManager {
    repository: Arc<dyn JobRepository>,
    registry: ProcessorRegistry,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: JobConfig,
    active: ActiveJobs,
    pool: Mutex<Option<RunningPool>>,
}

impl JobManager {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        registry: ProcessorRegistry,
        events: EventBus,
        clock: Arc<dyn Clock>,
        config: JobConfig,
    ) -> Self {
        Self {
            repository,
            registry,
            events,
            clock,
            config,
            active: ActiveJobs::default(),
            pool: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        self.pool.lock().await.is_some()
    }

    /// Number of jobs executing in this process right now.
    pub async fn active_job_count(&self) -> usize {
        self.active.len().await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Reset interrupted jobs, spawn the worker pool and dispatcher, then
    /// queue the reset jobs.
    ///
    /// The pool lock is held throughout, so a job created while `start` runs
    /// waits for it and is never reset or queued twice. Calling `start` on a
    /// running manager does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the resumable jobs cannot be loaded or reset. No
    /// worker has been spawned at that point and the manager stays stopped.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let mut pool = self.pool.lock().await;
        if pool.is_some() {
            debug!("Job manager already running");
            return Ok(());
        }

        let backlog = self.reset_interrupted().await?;

        let shutdown = CancellationToken::new();
        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity);
        let (slot_tx, slot_rx) = mpsc::channel(self.config.worker_count);

        let shared = Arc::new(WorkerShared {
            repository: self.repository.clone(),
            registry: self.registry.clone(),
            events: self.events.clone(),
            clock: self.clock.clone(),
            active: self.active.clone(),
            job_timeout: self.config.job_timeout,
        });

        let mut handles = Vec::with_capacity(self.config.worker_count + 1);
        for id in 0..self.config.worker_count {
            let worker = Worker::new(id, shared.clone(), slot_tx.clone(), shutdown.clone());
            handles.push(tokio::spawn(worker.run()));
        }
        drop(slot_tx);
        handles.push(tokio::spawn(run_dispatcher(
            queue_rx,
            slot_rx,
            shutdown.clone(),
        )));

        *pool = Some(RunningPool {
            queue: queue_tx.clone(),
            shutdown,
            handles,
        });
        drop(pool);

        info!(
            workers = self.config.worker_count,
            queue_capacity = self.config.queue_capacity,
            resumed = backlog.len(),
            "Job manager started"
        );

        // A waiting send delivers a backlog larger than the queue.
        if !backlog.is_empty() {
            tokio::spawn(async move {
                for job_id in backlog {
                    if queue_tx.send(job_id).await.is_err() {
                        debug!(job_id = %job_id, "Pool stopped before resumed job was queued");
                        break;
                    }
                }
            });
        }

        Ok(())
    }

    /// Reset every pending or running job to pending. Returns the ids to
    /// queue, oldest first.
    async fn reset_interrupted(&self) -> Result<Vec<JobId>> {
        let jobs = self.repository.find_resumable().await?;

        let now = self.clock.unix_timestamp();
        let mut backlog = Vec::with_capacity(jobs.len());
        for job in jobs {
            if !self.repository.reset_to_pending(&job.id, now).await? {
                continue;
            }
            info!(job_id = %job.id, previous_status = %job.status, "Resuming job");
            self.events.publish(CoreEvent::Job(JobEvent::Resumed {
                job_id: job.id.to_string(),
                previous_status: job.status.to_string(),
            }));
            backlog.push(job.id);
        }

        Ok(backlog)
    }

    /// Stop dispatching, signal all workers and wait for them to exit.
    ///
    /// Jobs still executing observe the cancellation and are left `running`
    /// for the next [`start`](Self::start) to resume. A processor that has
    /// not returned within `shutdown_grace` is aborted and left the same way.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let Some(pool) = self.pool.lock().await.take() else {
            debug!("Job manager not running");
            return;
        };

        pool.shutdown.cancel();
        drop(pool.queue);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        let mut aborted = false;
        for mut handle in pool.handles {
            let result = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(result) => result,
                Err(_) => {
                    if !aborted {
                        let count = self.active.abort_all().await;
                        warn!(jobs = count, "Shutdown grace elapsed, aborting jobs");
                        aborted = true;
                    }
                    handle.await
                }
            };
            if let Err(e) = result {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }

        info!("Job manager stopped");
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Create a job and offer it to the dispatch queue
    ///
    /// The job is persisted before it is queued, so it survives a crash
    /// between the two. When the manager has not been started yet the job
    /// stays pending and is picked up by [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// - [`SyncError::Validation`] if the job type needs an owner and none is given
    /// - [`SyncError::Conflict`] if the owner already has an active job of an
    ///   exclusive type
    ///
    /// A full queue is not an error here: the returned job is already
    /// `failed` with a queue-full message.
    #[instrument(skip_all, fields(job_type = %job_type, owner = ?owner))]
    pub async fn create_job(
        &self,
        job_type: JobType,
        owner: Option<OwnerId>,
        metadata: Map<String, Value>,
    ) -> Result<Job> {
        let now = self.clock.unix_timestamp();
        let job = Job::new(job_type, owner, metadata, now)?;

        if let Some(owner) = owner.filter(|_| job_type.is_exclusive_per_owner()) {
            if self.repository.has_active(owner, job_type).await? {
                return Err(SyncError::Conflict { owner_id: owner.0 });
            }
        }

        self.repository.insert(&job).await?;
        info!(job_id = %job.id, "Job created");

        self.events.publish(CoreEvent::Job(JobEvent::Created {
            job_id: job.id.to_string(),
            job_type: job_type.to_string(),
            owner_id: owner.map(|o| o.0),
        }));

        let queue = self
            .pool
            .lock()
            .await
            .as_ref()
            .map(|pool| pool.queue.clone());

        let Some(queue) = queue else {
            debug!(job_id = %job.id, "Manager not started, job left pending");
            return Ok(job);
        };

        match tokio::time::timeout(self.config.enqueue_timeout, queue.send(job.id)).await {
            Ok(Ok(())) => Ok(job),
            Ok(Err(_)) => {
                debug!(job_id = %job.id, "Pool stopped meanwhile, job left pending");
                Ok(job)
            }
            Err(_) => {
                warn!(job_id = %job.id, "Dispatch queue full, failing job");
                let now = self.clock.unix_timestamp();
                self.repository
                    .fail_pending(&job.id, QUEUE_FULL_MESSAGE, now)
                    .await?;
                self.events.publish(CoreEvent::Job(JobEvent::Failed {
                    job_id: job.id.to_string(),
                    message: QUEUE_FULL_MESSAGE.to_string(),
                }));
                self.get_job(&job.id).await
            }
        }
    }

    /// # Errors
    ///
    /// [`SyncError::JobNotFound`] if no such job exists.
    pub async fn get_job(&self, id: &JobId) -> Result<Job> {
        self.repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| SyncError::JobNotFound {
                job_id: id.to_string(),
            })
    }

    /// The owner's jobs, newest first. `limit` falls back to the configured
    /// default and is capped at the configured maximum.
    pub async fn get_user_jobs(&self, owner: OwnerId, limit: Option<u32>) -> Result<Vec<Job>> {
        self.repository
            .find_by_owner(owner, self.config.history_limit(limit))
            .await
    }

    /// Apply a partial progress update. Never changes status; updates to a
    /// job that is not running are ignored.
    ///
    /// # Errors
    ///
    /// [`SyncError::JobNotFound`] if no such job exists.
    pub async fn update_job_progress(&self, id: &JobId, update: ProgressUpdate) -> Result<()> {
        let reporter = ProgressReporter::new(
            *id,
            self.repository.clone(),
            self.events.clone(),
            self.clock.clone(),
        );

        if !reporter.report(update).await? {
            // Distinguish "not running" from "does not exist".
            self.get_job(id).await?;
        }
        Ok(())
    }

    /// Cancel a pending or running job
    ///
    /// The persisted status flips to `cancelled` and, if the job is executing
    /// in this process, its cancellation token fires so the processor stops
    /// at its next loop iteration. A terminal job is returned unchanged.
    ///
    /// # Errors
    ///
    /// [`SyncError::JobNotFound`] if no such job exists.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn cancel_job(&self, id: &JobId) -> Result<Job> {
        let job = self.get_job(id).await?;
        if !job.status.can_transition_to(JobStatus::Cancelled) {
            debug!(status = %job.status, "Job already terminal, nothing to cancel");
            return Ok(job);
        }

        let now = self.clock.unix_timestamp();
        if self.repository.cancel(id, now).await? {
            info!("Job cancelled");
            self.events.publish(CoreEvent::Job(JobEvent::Cancelled {
                job_id: id.to_string(),
            }));
            if self.active.cancel(id).await {
                debug!("Signalled running processor");
            }
        }

        self.get_job(id).await
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        if let Ok(mut pool) = self.pool.try_lock() {
            if let Some(pool) = pool.take() {
                pool.shutdown.cancel();
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{JobContext, JobProcessor};
    use crate::repository::JobOutcome;
    use crate::{JobCounters, JobStatus, SqliteJobRepository};
    use async_trait::async_trait;
    use bridge_traits::time::ManualClock;
    use core_library::db::create_test_pool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Completes immediately with fixed counters.
    struct InstantProcessor {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl JobProcessor for InstantProcessor {
        async fn process(&self, _job: &Job, ctx: &JobContext) -> Result<JobCounters> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            ctx.report(ProgressUpdate::new(50, "Halfway")).await?;
            Ok(JobCounters {
                total: 4,
                processed: 4,
                successful: 3,
                failed: 1,
            })
        }
    }

    /// Signals when started, then loops until cancelled.
    struct BlockingProcessor {
        started: Notify,
    }

    #[async_trait]
    impl JobProcessor for BlockingProcessor {
        async fn process(&self, _job: &Job, ctx: &JobContext) -> Result<JobCounters> {
            self.started.notify_one();
            loop {
                ctx.check_cancelled()?;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    struct FailingProcessor;

    #[async_trait]
    impl JobProcessor for FailingProcessor {
        async fn process(&self, _job: &Job, _ctx: &JobContext) -> Result<JobCounters> {
            Err(SyncError::Discovery("server list unavailable".to_string()))
        }
    }

    struct PanickingProcessor;

    #[async_trait]
    impl JobProcessor for PanickingProcessor {
        async fn process(&self, _job: &Job, _ctx: &JobContext) -> Result<JobCounters> {
            panic!("processor bug");
        }
    }

    async fn manager_with(
        processor: Arc<dyn JobProcessor>,
        config: JobConfig,
    ) -> (JobManager, Arc<SqliteJobRepository>) {
        let pool = create_test_pool().await.unwrap();
        let repo = Arc::new(SqliteJobRepository::new(pool));
        let manager = JobManager::new(
            repo.clone(),
            ProcessorRegistry::new().with_processor(JobType::FullSync, processor),
            EventBus::new(64),
            Arc::new(ManualClock::default()),
            config,
        );
        (manager, repo)
    }

    async fn wait_for_status(manager: &JobManager, id: &JobId, status: JobStatus) -> Job {
        for _ in 0..500 {
            let job = manager.get_job(id).await.unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, status);
    }

    #[tokio::test]
    async fn test_job_runs_to_completion() {
        let processor = Arc::new(InstantProcessor {
            runs: AtomicUsize::new(0),
        });
        let (manager, _) = manager_with(processor.clone(), JobConfig::default()).await;
        manager.start().await.unwrap();

        let job = manager
            .create_job(JobType::FullSync, Some(OwnerId(1)), Map::new())
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let done = wait_for_status(&manager, &job.id, JobStatus::Completed).await;
        assert_eq!(done.progress, 100);
        assert_eq!(done.counters.successful, 3);
        assert_eq!(done.counters.failed, 1);
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());
        assert_eq!(processor.runs.load(Ordering::SeqCst), 1);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_second_full_sync_for_owner_conflicts() {
        let (manager, _) = manager_with(
            Arc::new(BlockingProcessor {
                started: Notify::new(),
            }),
            JobConfig::default(),
        )
        .await;

        manager
            .create_job(JobType::FullSync, Some(OwnerId(5)), Map::new())
            .await
            .unwrap();
        let err = manager
            .create_job(JobType::FullSync, Some(OwnerId(5)), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Conflict { owner_id: 5 }));

        // Another owner is unaffected.
        manager
            .create_job(JobType::FullSync, Some(OwnerId(6)), Map::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_sync_without_owner_is_rejected() {
        let (manager, repo) = manager_with(Arc::new(FailingProcessor), JobConfig::default()).await;
        let err = manager
            .create_job(JobType::FullSync, None, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(repo.find_resumable().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_processor_error_fails_job_with_message() {
        let (manager, _) = manager_with(Arc::new(FailingProcessor), JobConfig::default()).await;
        manager.start().await.unwrap();

        let job = manager
            .create_job(JobType::FullSync, Some(OwnerId(1)), Map::new())
            .await
            .unwrap();
        let failed = wait_for_status(&manager, &job.id, JobStatus::Failed).await;
        assert!(failed
            .error_message
            .unwrap()
            .contains("server list unavailable"));

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_panic_is_recorded_and_worker_survives() {
        let (manager, _) = manager_with(
            Arc::new(PanickingProcessor),
            JobConfig::default().with_worker_count(1),
        )
        .await;
        manager.start().await.unwrap();

        let first = manager
            .create_job(JobType::FullSync, Some(OwnerId(1)), Map::new())
            .await
            .unwrap();
        wait_for_status(&manager, &first.id, JobStatus::Failed).await;

        // The single worker is still alive to take the next job.
        let second = manager
            .create_job(JobType::FullSync, Some(OwnerId(2)), Map::new())
            .await
            .unwrap();
        wait_for_status(&manager, &second.id, JobStatus::Failed).await;

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_job_exceeding_deadline_fails_as_timed_out() {
        let (manager, _) = manager_with(
            Arc::new(BlockingProcessor {
                started: Notify::new(),
            }),
            JobConfig::default().with_job_timeout(Duration::from_millis(50)),
        )
        .await;
        manager.start().await.unwrap();

        let job = manager
            .create_job(JobType::FullSync, Some(OwnerId(1)), Map::new())
            .await
            .unwrap();
        let failed = wait_for_status(&manager, &job.id, JobStatus::Failed).await;
        assert!(failed.error_message.unwrap().contains("timed out"));
        assert_eq!(manager.active_job_count().await, 0);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_running_job_stops_processor() {
        let processor = Arc::new(BlockingProcessor {
            started: Notify::new(),
        });
        let (manager, _) = manager_with(processor.clone(), JobConfig::default()).await;
        manager.start().await.unwrap();

        let job = manager
            .create_job(JobType::FullSync, Some(OwnerId(1)), Map::new())
            .await
            .unwrap();
        processor.started.notified().await;

        let cancelled = manager.cancel_job(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        for _ in 0..100 {
            if manager.active_job_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.active_job_count().await, 0);

        // The worker never overwrites the cancellation.
        let job = manager.get_job(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_terminal_job_is_a_no_op() {
        let (manager, _) = manager_with(Arc::new(FailingProcessor), JobConfig::default()).await;
        manager.start().await.unwrap();

        let job = manager
            .create_job(JobType::FullSync, Some(OwnerId(1)), Map::new())
            .await
            .unwrap();
        wait_for_status(&manager, &job.id, JobStatus::Failed).await;

        let after = manager.cancel_job(&job.id).await.unwrap();
        assert_eq!(after.status, JobStatus::Failed);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (manager, _) = manager_with(Arc::new(FailingProcessor), JobConfig::default()).await;
        let id = JobId::new();
        assert!(matches!(
            manager.get_job(&id).await,
            Err(SyncError::JobNotFound { .. })
        ));
        assert!(matches!(
            manager.cancel_job(&id).await,
            Err(SyncError::JobNotFound { .. })
        ));
        assert!(matches!(
            manager
                .update_job_progress(&id, ProgressUpdate::new(10, "x"))
                .await,
            Err(SyncError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_full_queue_fails_job_immediately() {
        let processor = Arc::new(BlockingProcessor {
            started: Notify::new(),
        });
        let config = JobConfig::default()
            .with_worker_count(1)
            .with_queue_capacity(1)
            .with_enqueue_timeout(Duration::from_millis(20));
        let (manager, _) = manager_with(processor.clone(), config).await;
        manager.start().await.unwrap();

        // Occupies the only worker.
        manager
            .create_job(JobType::FullSync, Some(OwnerId(1)), Map::new())
            .await
            .unwrap();
        processor.started.notified().await;

        // Taken by the dispatcher, which then waits for a free worker.
        manager
            .create_job(JobType::FullSync, Some(OwnerId(2)), Map::new())
            .await
            .unwrap();
        // Fills the queue.
        manager
            .create_job(JobType::FullSync, Some(OwnerId(3)), Map::new())
            .await
            .unwrap();

        let rejected = manager
            .create_job(JobType::FullSync, Some(OwnerId(4)), Map::new())
            .await
            .unwrap();
        assert_eq!(rejected.status, JobStatus::Failed);
        assert_eq!(rejected.error_message.as_deref(), Some(QUEUE_FULL_MESSAGE));

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_user_jobs_are_newest_first_and_limited() {
        let (manager, _) = manager_with(Arc::new(FailingProcessor), JobConfig::default()).await;
        manager.start().await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let job = manager
                .create_job(JobType::FullSync, Some(OwnerId(9)), Map::new())
                .await
                .unwrap();
            wait_for_status(&manager, &job.id, JobStatus::Failed).await;
            ids.push(job.id);
        }

        let jobs = manager.get_user_jobs(OwnerId(9), Some(2)).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, ids[2]);
        assert_eq!(jobs[1].id, ids[1]);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_leaves_interrupted_job_running_and_start_resumes_it() {
        let processor = Arc::new(BlockingProcessor {
            started: Notify::new(),
        });
        let (manager, repo) = manager_with(processor.clone(), JobConfig::default()).await;
        let mut events = manager.events.subscribe();
        manager.start().await.unwrap();

        let job = manager
            .create_job(JobType::FullSync, Some(OwnerId(1)), Map::new())
            .await
            .unwrap();
        processor.started.notified().await;

        manager.stop().await;
        let interrupted = repo.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(interrupted.status, JobStatus::Running);

        manager.start().await.unwrap();
        processor.started.notified().await;

        let mut resumed = false;
        while let Ok(event) = events.try_recv() {
            if let CoreEvent::Job(JobEvent::Resumed {
                job_id,
                previous_status,
            }) = event
            {
                assert_eq!(job_id, job.id.to_string());
                assert_eq!(previous_status, "running");
                resumed = true;
            }
        }
        assert!(resumed);
        assert_eq!(
            manager.get_job(&job.id).await.unwrap().status,
            JobStatus::Running
        );

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_job_created_before_start_runs_after_start() {
        let processor = Arc::new(InstantProcessor {
            runs: AtomicUsize::new(0),
        });
        let (manager, _) = manager_with(processor.clone(), JobConfig::default()).await;

        let job = manager
            .create_job(JobType::FullSync, Some(OwnerId(1)), Map::new())
            .await
            .unwrap();
        assert!(!manager.is_running().await);

        manager.start().await.unwrap();
        wait_for_status(&manager, &job.id, JobStatus::Completed).await;
        assert_eq!(processor.runs.load(Ordering::SeqCst), 1);

        manager.stop().await;
        assert!(!manager.is_running().await);
    }

    /// Takes a while per run so duplicate dispatches overlap.
    struct SlowProcessor {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl JobProcessor for SlowProcessor {
        async fn process(&self, _job: &Job, _ctx: &JobContext) -> Result<JobCounters> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(JobCounters::default())
        }
    }

    /// Never looks at its cancellation token.
    struct StubbornProcessor {
        started: Notify,
    }

    #[async_trait]
    impl JobProcessor for StubbornProcessor {
        async fn process(&self, _job: &Job, _ctx: &JobContext) -> Result<JobCounters> {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(JobCounters::default())
        }
    }

    /// SQLite repository whose resumable scan is slow to answer.
    struct SlowScanRepository {
        inner: SqliteJobRepository,
        scan_delay: Duration,
    }

    #[async_trait]
    impl JobRepository for SlowScanRepository {
        async fn insert(&self, job: &Job) -> Result<()> {
            self.inner.insert(job).await
        }

        async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
            self.inner.find_by_id(id).await
        }

        async fn find_by_owner(&self, owner: OwnerId, limit: u32) -> Result<Vec<Job>> {
            self.inner.find_by_owner(owner, limit).await
        }

        async fn has_active(&self, owner: OwnerId, job_type: JobType) -> Result<bool> {
            self.inner.has_active(owner, job_type).await
        }

        async fn update_progress(
            &self,
            id: &JobId,
            update: &ProgressUpdate,
            now: i64,
        ) -> Result<bool> {
            self.inner.update_progress(id, update, now).await
        }

        async fn mark_running(&self, id: &JobId, now: i64) -> Result<Option<Job>> {
            self.inner.mark_running(id, now).await
        }

        async fn finish(&self, id: &JobId, outcome: &JobOutcome, now: i64) -> Result<Option<Job>> {
            self.inner.finish(id, outcome, now).await
        }

        async fn fail_pending(&self, id: &JobId, message: &str, now: i64) -> Result<bool> {
            self.inner.fail_pending(id, message, now).await
        }

        async fn cancel(&self, id: &JobId, now: i64) -> Result<bool> {
            self.inner.cancel(id, now).await
        }

        async fn find_resumable(&self) -> Result<Vec<Job>> {
            tokio::time::sleep(self.scan_delay).await;
            self.inner.find_resumable().await
        }

        async fn reset_to_pending(&self, id: &JobId, now: i64) -> Result<bool> {
            self.inner.reset_to_pending(id, now).await
        }

        async fn delete_terminal_before(&self, cutoff: i64) -> Result<u64> {
            self.inner.delete_terminal_before(cutoff).await
        }
    }

    #[tokio::test]
    async fn test_job_created_during_start_runs_once() {
        let pool = create_test_pool().await.unwrap();
        let repository = Arc::new(SlowScanRepository {
            inner: SqliteJobRepository::new(pool),
            scan_delay: Duration::from_millis(200),
        });
        let processor = Arc::new(SlowProcessor {
            runs: AtomicUsize::new(0),
        });
        let manager = Arc::new(JobManager::new(
            repository,
            ProcessorRegistry::new().with_processor(JobType::FullSync, processor.clone()),
            EventBus::new(64),
            Arc::new(ManualClock::default()),
            JobConfig::default(),
        ));

        let starting = tokio::spawn({
            let manager = manager.clone();
            async move { manager.start().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let job = manager
            .create_job(JobType::FullSync, Some(OwnerId(1)), Map::new())
            .await
            .unwrap();
        starting.await.unwrap().unwrap();

        wait_for_status(&manager, &job.id, JobStatus::Completed).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(processor.runs.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_job_count().await, 0);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_aborts_job_that_ignores_cancellation() {
        let processor = Arc::new(StubbornProcessor {
            started: Notify::new(),
        });
        let (manager, _) = manager_with(
            processor.clone(),
            JobConfig::default()
                .with_job_timeout(Duration::from_secs(3600))
                .with_shutdown_grace(Duration::from_millis(100)),
        )
        .await;
        manager.start().await.unwrap();

        let job = manager
            .create_job(JobType::FullSync, Some(OwnerId(1)), Map::new())
            .await
            .unwrap();
        processor.started.notified().await;

        tokio::time::timeout(Duration::from_secs(5), manager.stop())
            .await
            .expect("stop should not wait for the job deadline");

        assert!(!manager.is_running().await);
        assert_eq!(manager.active_job_count().await, 0);
        // Left for the next start to resume.
        assert_eq!(
            manager.get_job(&job.id).await.unwrap().status,
            JobStatus::Running
        );
    }
}
