//! # Job Processors
//!
//! Each [`JobType`] is bound to exactly one [`JobProcessor`] in a
//! [`ProcessorRegistry`] filled once at startup. Workers look the processor up
//! by the job's type and hand it a [`JobContext`] carrying the job's
//! cancellation token and a progress reporter.

use crate::{Job, JobCounters, JobId, JobRepository, JobType, ProgressUpdate, Result, SyncError};
use async_trait::async_trait;
use bridge_traits::time::Clock;
use core_runtime::events::{CoreEvent, EventBus, JobEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The unit of work for one job type.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Run the job to completion and return its final counters.
    ///
    /// Implementations check [`JobContext::check_cancelled`] once per loop
    /// iteration and return [`SyncError::Cancelled`] when it fires.
    async fn process(&self, job: &Job, ctx: &JobContext) -> Result<JobCounters>;
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<JobType, Arc<dyn JobProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_processor(mut self, job_type: JobType, processor: Arc<dyn JobProcessor>) -> Self {
        self.register(job_type, processor);
        self
    }

    /// Bind a processor, replacing any previous binding for the type.
    pub fn register(&mut self, job_type: JobType, processor: Arc<dyn JobProcessor>) {
        self.processors.insert(job_type, processor);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobProcessor>> {
        self.processors.get(&job_type).cloned()
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.processors.contains_key(&job_type)
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("job_types", &self.processors.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Persists progress for one job and mirrors it on the event bus.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    repository: Arc<dyn JobRepository>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl ProgressReporter {
    pub fn new(
        job_id: JobId,
        repository: Arc<dyn JobRepository>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            job_id,
            repository,
            events,
            clock,
        }
    }

    /// Returns false when the job is no longer running.
    pub async fn report(&self, update: ProgressUpdate) -> Result<bool> {
        let applied = self
            .repository
            .update_progress(&self.job_id, &update, self.clock.unix_timestamp())
            .await?;

        if applied {
            let counters = update.counters.unwrap_or_default();
            self.events.publish(CoreEvent::Job(JobEvent::Progress {
                job_id: self.job_id.to_string(),
                progress: update.progress,
                step: update.step,
                processed: counters.processed,
                total: counters.total,
            }));
        } else {
            debug!(job_id = %self.job_id, "Progress ignored, job not running");
        }

        Ok(applied)
    }
}

// ============================================================================
// Context
// ============================================================================

pub struct JobContext {
    cancel: CancellationToken,
    progress: ProgressReporter,
    events: EventBus,
}

impl JobContext {
    pub fn new(cancel: CancellationToken, progress: ProgressReporter, events: EventBus) -> Self {
        Self {
            cancel,
            progress,
            events,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    pub async fn report(&self, update: ProgressUpdate) -> Result<bool> {
        self.progress.report(update).await
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}
