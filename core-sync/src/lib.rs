//! # Sync Engine Module
//!
//! Durable background jobs that mirror a user's media-server catalog and
//! match it against the metadata provider.
//!
//! ## Overview
//!
//! This module manages:
//! - The job lifecycle, persisted in the `jobs` table and resumable across
//!   restarts
//! - A fixed worker pool fed through a bounded dispatch queue
//! - The full sync processor: discovery, item sync, matching, stale-item cleanup
//! - A periodic maintenance pass independent of any job
//!
//! ## Components
//!
//! - **Job State Machine** (`job`): statuses, validated transitions, progress
//! - **Job Repository** (`repository`): conditional status updates on SQLite
//! - **Processors** (`processor`): job type to processor registry, job context
//! - **Worker Pool** (`worker`): dispatcher and workers with a per-job deadline
//! - **Job Manager** (`manager`): create / get / list / cancel, start and stop
//! - **Full Sync** (`full_sync`): the `FullSync` processor
//! - **Cleanup Service** (`cleanup`): ordered idempotent maintenance steps
//!
//! ## Usage
//!
//! ```ignore
//! let registry = ProcessorRegistry::new()
//!     .with_processor(JobType::FullSync, Arc::new(sync_processor));
//! let manager = JobManager::new(repo, registry, events, clock, config.jobs);
//! manager.start().await?;
//!
//! let job = manager.create_job(JobType::FullSync, Some(owner), Map::new()).await?;
//! let job = manager.get_job(&job.id).await?;
//! ```

pub mod cleanup;
pub mod error;
pub mod full_sync;
pub mod job;
pub mod manager;
pub mod processor;
pub mod repository;
mod worker;

pub use cleanup::{CleanupReport, CleanupService, StepReport};
pub use error::{ErrorKind, Result, SyncError};
pub use full_sync::{SyncProcessor, SyncRepositories};
pub use job::{Job, JobCounters, JobId, JobStatus, JobType, ProgressUpdate};
pub use manager::JobManager;
pub use processor::{JobContext, JobProcessor, ProcessorRegistry, ProgressReporter};
pub use repository::{JobOutcome, JobRepository, SqliteJobRepository};
