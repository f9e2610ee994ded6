//! # Engine Configuration
//!
//! Central configuration for the sync engine, assembled with a builder and
//! validated once at startup.
//!
//! ## Overview
//!
//! [`CoreConfig`] groups the tunables of every component:
//! - [`JobConfig`] - worker pool size, dispatch queue, per-job deadline
//! - [`RateLimitConfig`] - token bucket shared by all metadata-provider calls
//! - [`MatchingConfig`] - attempt cap and concurrency of identifier matching
//! - [`SyncConfig`] - item paging of the full sync
//! - [`CleanupConfig`] - maintenance cadence and retention windows
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::config::{CoreConfig, RateLimitConfig};
//! use std::time::Duration;
//!
//! let config = CoreConfig::builder()
//!     .database_path("/var/lib/media-sync/engine.db")
//!     .worker_count(4)
//!     .rate_limit(RateLimitConfig::from_ceiling(40, Duration::from_secs(10), 0.8))
//!     .build()
//!     .expect("valid configuration");
//!
//! assert_eq!(config.jobs.worker_count, 4);
//! ```

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CoreConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
    pub jobs: JobConfig,
    pub rate_limit: RateLimitConfig,
    pub matching: MatchingConfig,
    pub sync: SyncConfig,
    pub cleanup: CleanupConfig,
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        self.jobs.validate()?;
        self.rate_limit.validate()?;
        self.matching.validate()?;
        self.sync.validate()?;
        self.cleanup.validate()?;

        Ok(())
    }
}

// ============================================================================
// Job manager / worker pool
// ============================================================================

/// Job manager and worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Capacity of the dispatch queue.
    pub queue_capacity: usize,
    /// How long `create_job` waits for queue space before failing the job.
    pub enqueue_timeout: Duration,
    /// Hard deadline for a single job execution.
    pub job_timeout: Duration,
    /// How long `stop` waits for in-flight jobs before aborting them.
    pub shutdown_grace: Duration,
    /// Page size used by `get_user_jobs` when the caller gives none.
    pub default_history_limit: u32,
    /// Upper bound on `get_user_jobs` page size.
    pub max_history_limit: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            queue_capacity: 100,
            enqueue_timeout: Duration::from_secs(5),
            job_timeout: Duration::from_secs(2 * 60 * 60),
            shutdown_grace: Duration::from_secs(10),
            default_history_limit: 20,
            max_history_limit: 100,
        }
    }
}

impl JobConfig {
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Clamp a caller-provided history limit into `1..=max_history_limit`.
    pub fn history_limit(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_history_limit)
            .clamp(1, self.max_history_limit)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::Config(
                "Worker count must be greater than 0".to_string(),
            ));
        }
        if self.worker_count > 64 {
            return Err(Error::Config(
                "Worker count exceeds maximum of 64".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config(
                "Job queue capacity must be greater than 0".to_string(),
            ));
        }
        if self.job_timeout.is_zero() {
            return Err(Error::Config(
                "Job timeout must be greater than 0".to_string(),
            ));
        }
        if self.default_history_limit == 0 || self.default_history_limit > self.max_history_limit
        {
            return Err(Error::Config(format!(
                "Default history limit must be within 1..={}",
                self.max_history_limit
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Rate limiter
// ============================================================================

/// Token bucket settings for the metadata provider.
///
/// The bucket starts full. One token is added every `refill_interval` up to
/// `capacity`; every provider call (including each retry) consumes one.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_interval: Duration,
    /// Bounded intake queue between callers and the dispatch loop.
    pub intake_capacity: usize,
    /// How long a caller waits for intake space before giving up.
    pub intake_timeout: Duration,
    /// Overall deadline for one call, queueing and retries included.
    pub request_timeout: Duration,
    /// Retries after the first attempt, transient errors only.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::from_ceiling(40, Duration::from_secs(10), 0.8)
    }
}

impl RateLimitConfig {
    /// Derive a bucket from an upstream ceiling of `requests` per `window`,
    /// keeping only `headroom` (0.0–1.0) of it.
    pub fn from_ceiling(requests: u32, window: Duration, headroom: f64) -> Self {
        let allowed = ((requests as f64) * headroom).floor().max(1.0);
        let refill_interval = window.div_f64(allowed);

        Self {
            capacity: allowed as u32,
            refill_interval,
            intake_capacity: 1000,
            intake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }

    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_interval,
            ..Self::default()
        }
    }

    pub fn with_intake(mut self, capacity: usize, timeout: Duration) -> Self {
        self.intake_capacity = capacity;
        self.intake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, initial_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Backoff before retry number `retry` (0-based), doubling each time and
    /// capped at `max_backoff`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Config(
                "Rate limit capacity must be greater than 0".to_string(),
            ));
        }
        if self.refill_interval.is_zero() {
            return Err(Error::Config(
                "Rate limit refill interval must be greater than 0".to_string(),
            ));
        }
        if self.intake_capacity == 0 {
            return Err(Error::Config(
                "Rate limit intake capacity must be greater than 0".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config(
                "Rate limit request timeout must be greater than 0".to_string(),
            ));
        }
        if self.max_retries > 10 {
            return Err(Error::Config(
                "Rate limit retries exceed maximum of 10".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Matching / sync / cleanup
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingConfig {
    /// Items with this many failed attempts are no longer matched.
    pub max_attempts: u32,
    /// Concurrent match resolutions per job.
    pub concurrency: usize,
    /// Entries in the in-memory GUID cache.
    pub cache_capacity: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            concurrency: 4,
            cache_capacity: 1024,
        }
    }
}

impl MatchingConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config(
                "Matching attempt cap must be greater than 0".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(Error::Config(
                "Matching concurrency must be greater than 0".to_string(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(Error::Config(
                "Matching cache capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Items requested per page from the external library.
    pub page_size: u64,
    /// Report progress every this many items inside long loops.
    pub progress_every: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            progress_every: 25,
        }
    }
}

impl SyncConfig {
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size > 1000 {
            return Err(Error::Config(
                "Sync page size must be within 1..=1000".to_string(),
            ));
        }
        if self.progress_every == 0 {
            return Err(Error::Config(
                "Progress interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupConfig {
    /// Ticker period of the maintenance pass.
    pub interval: Duration,
    /// Access grants not verified for this long are deactivated.
    pub grant_stale_after: Duration,
    /// Terminal jobs older than this are deleted.
    pub job_retention: Duration,
}

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(6 * 60 * 60),
            grant_stale_after: DAY * 30,
            job_retention: DAY * 30,
        }
    }
}

impl CleanupConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_grant_stale_after(mut self, window: Duration) -> Self {
        self.grant_stale_after = window;
        self
    }

    pub fn with_job_retention(mut self, window: Duration) -> Self {
        self.job_retention = window;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::Config(
                "Cleanup interval must be greater than 0".to_string(),
            ));
        }
        if self.grant_stale_after < DAY {
            return Err(Error::Config(
                "Access grants cannot go stale in less than one day".to_string(),
            ));
        }
        if self.job_retention < DAY {
            return Err(Error::Config(
                "Job retention must be at least one day".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Default)]
pub struct CoreConfigBuilder {
    database_path: Option<PathBuf>,
    jobs: JobConfig,
    rate_limit: RateLimitConfig,
    matching: MatchingConfig,
    sync: SyncConfig,
    cleanup: CleanupConfig,
}

impl CoreConfigBuilder {
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.jobs.worker_count = count;
        self
    }

    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.jobs.job_timeout = timeout;
        self
    }

    pub fn jobs(mut self, jobs: JobConfig) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn matching(mut self, matching: MatchingConfig) -> Self {
        self.matching = matching;
        self
    }

    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn cleanup(mut self, cleanup: CleanupConfig) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn build(self) -> Result<CoreConfig> {
        let database_path = self.database_path.ok_or_else(|| {
            Error::Config("Database path is required. Use .database_path() to set it.".to_string())
        })?;

        let config = CoreConfig {
            database_path,
            jobs: self.jobs,
            rate_limit: self.rate_limit,
            matching: self.matching,
            sync: self.sync,
            cleanup: self.cleanup,
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_database_path() {
        let err = CoreConfig::builder().build().unwrap_err();
        assert!(err.to_string().contains("Database path is required"));
    }

    #[test]
    fn test_builder_defaults() {
        let config = CoreConfig::builder()
            .database_path("/tmp/engine.db")
            .build()
            .unwrap();

        assert_eq!(config.jobs.worker_count, 3);
        assert_eq!(config.jobs.job_timeout, Duration::from_secs(7200));
        assert_eq!(config.rate_limit.capacity, 32);
        assert_eq!(config.matching.max_attempts, 3);
        assert_eq!(config.cleanup.job_retention, DAY * 30);
    }

    #[test]
    fn test_rate_limit_from_ceiling_keeps_headroom() {
        let config = RateLimitConfig::from_ceiling(50, Duration::from_secs(1), 0.8);
        assert_eq!(config.capacity, 40);
        assert_eq!(config.refill_interval, Duration::from_millis(25));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RateLimitConfig::new(1, Duration::from_millis(100))
            .with_retries(5, Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(500));

        assert_eq!(config.backoff_for(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for(2), Duration::from_millis(400));
        assert_eq!(config.backoff_for(3), Duration::from_millis(500));
        assert_eq!(config.backoff_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let err = CoreConfig::builder()
            .database_path("/tmp/engine.db")
            .worker_count(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let config = RateLimitConfig::new(0, Duration::from_millis(250));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_short_retention() {
        let cleanup = CleanupConfig::default().with_job_retention(Duration::from_secs(60));
        assert!(cleanup.validate().is_err());
    }

    #[test]
    fn test_history_limit_is_clamped() {
        let jobs = JobConfig::default();
        assert_eq!(jobs.history_limit(None), 20);
        assert_eq!(jobs.history_limit(Some(0)), 1);
        assert_eq!(jobs.history_limit(Some(5000)), 100);
    }
}
