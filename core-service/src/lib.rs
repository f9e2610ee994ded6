//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (identity, external
//! account store, media-server client, metadata provider) into the sync
//! engine. Exactly one instance of every component is built here and handed
//! down by reference: one database pool, one event bus, one rate limiter
//! shared by every metadata call, one job manager and one cleanup service.
//!
//! ```ignore
//! let deps = CoreDependencies::new(identity, accounts, media_server, provider);
//! let core = CoreService::bootstrap(CoreConfig::default(), deps).await?;
//! core.start().await?;
//!
//! let receipt = core.trigger_full_sync(&RequestCredentials::bearer(token)).await?;
//! let job = core.get_job(&receipt.job_id).await?;
//!
//! core.shutdown().await;
//! ```

pub mod error;

pub use error::{CoreError, Result};

use std::sync::Arc;

use bridge_traits::time::{Clock, SystemClock};
use bridge_traits::{
    ExternalAccountStore, ExternalLibraryClient, IdentityResolver, MetadataProvider, OwnerId,
    RequestCredentials,
};
use core_library::db::{create_pool, DatabaseConfig};
use core_library::models::RateLimiterUsage;
use core_library::repositories::{
    SqliteAccessGrantRepository, SqliteItemRepository, SqliteLibraryRepository,
    SqliteMappingRepository, SqliteMovieRepository, SqliteUsageRepository, UsageRepository,
};
use core_metadata::{IdMatcher, RateLimiter, RateLimiterStats};
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus, EventStream};
use core_sync::{
    CleanupReport, CleanupService, Job, JobId, JobManager, JobStatus, JobType, ProcessorRegistry,
    SqliteJobRepository, SyncProcessor, SyncRepositories,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

const EVENT_BUS_CAPACITY: usize = 1024;

/// Aggregated handle to all bridge dependencies the core requires.
pub struct CoreDependencies {
    pub identity: Arc<dyn IdentityResolver>,
    pub accounts: Arc<dyn ExternalAccountStore>,
    pub library_client: Arc<dyn ExternalLibraryClient>,
    pub metadata_provider: Arc<dyn MetadataProvider>,
    pub clock: Arc<dyn Clock>,
}

impl CoreDependencies {
    /// Construct a dependency bundle from explicit bridge handles.
    pub fn new(
        identity: Arc<dyn IdentityResolver>,
        accounts: Arc<dyn ExternalAccountStore>,
        library_client: Arc<dyn ExternalLibraryClient>,
        metadata_provider: Arc<dyn MetadataProvider>,
    ) -> Self {
        Self {
            identity,
            accounts,
            library_client,
            metadata_provider,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// What a caller gets back from job creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReceipt {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: i64,
}

impl From<&Job> for JobReceipt {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            status: job.status,
            created_at: job.created_at,
        }
    }
}

struct CleanupTicker {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    config: CoreConfig,
    pool: SqlitePool,
    events: EventBus,
    identity: Arc<dyn IdentityResolver>,
    limiter: Arc<RateLimiter>,
    usage: Arc<dyn UsageRepository>,
    manager: JobManager,
    cleanup: Arc<CleanupService>,
    ticker: Mutex<Option<CleanupTicker>>,
}

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct CoreService {
    inner: Arc<Inner>,
}

impl CoreService {
    /// Validate the configuration, open the database and wire every component.
    ///
    /// Nothing runs in the background until [`start`](Self::start).
    pub async fn bootstrap(config: CoreConfig, deps: CoreDependencies) -> Result<Self> {
        config.validate()?;
        let pool = create_pool(DatabaseConfig::new(config.database_path.clone()))
            .await
            .map_err(|e| CoreError::InitializationFailed(e.to_string()))?;
        Ok(Self::with_pool(config, deps, pool))
    }

    /// Wire every component on an existing, migrated pool.
    pub fn with_pool(config: CoreConfig, deps: CoreDependencies, pool: SqlitePool) -> Self {
        let events = EventBus::new(EVENT_BUS_CAPACITY);
        let clock = deps.clock;

        let usage: Arc<dyn UsageRepository> = Arc::new(SqliteUsageRepository::new(pool.clone()));
        let limiter = Arc::new(
            RateLimiter::new(config.rate_limit.clone())
                .with_usage_repository(usage.clone(), clock.clone()),
        );

        let items = Arc::new(SqliteItemRepository::new(pool.clone()));
        let mappings = Arc::new(SqliteMappingRepository::new(pool.clone()));
        let matcher = Arc::new(IdMatcher::new(
            limiter.clone(),
            deps.metadata_provider,
            mappings.clone(),
            Arc::new(SqliteMovieRepository::new(pool.clone())),
            items.clone(),
            clock.clone(),
            config.matching.clone(),
        ));

        let processor = SyncProcessor::new(
            deps.accounts,
            deps.library_client,
            SyncRepositories::sqlite(pool.clone()),
            matcher,
            clock.clone(),
            config.sync.clone(),
        );

        let jobs = Arc::new(SqliteJobRepository::new(pool.clone()));
        let manager = JobManager::new(
            jobs.clone(),
            ProcessorRegistry::new().with_processor(JobType::FullSync, Arc::new(processor)),
            events.clone(),
            clock.clone(),
            config.jobs.clone(),
        );

        let cleanup = Arc::new(CleanupService::new(
            Arc::new(SqliteAccessGrantRepository::new(pool.clone())),
            items,
            mappings,
            Arc::new(SqliteLibraryRepository::new(pool.clone())),
            jobs,
            events.clone(),
            clock,
            config.cleanup.clone(),
            config.matching.max_attempts,
        ));

        Self {
            inner: Arc::new(Inner {
                config,
                pool,
                events,
                identity: deps.identity,
                limiter,
                usage,
                manager,
                cleanup,
                ticker: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the worker pool (resuming interrupted jobs) and the cleanup
    /// ticker.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        self.inner.manager.start().await?;

        let mut ticker = self.inner.ticker.lock().await;
        if ticker.is_none() {
            let shutdown = CancellationToken::new();
            let handle = self.inner.cleanup.clone().start(shutdown.clone());
            *ticker = Some(CleanupTicker { shutdown, handle });
        }

        info!("Core service started");
        Ok(())
    }

    /// Stop the cleanup ticker and the worker pool, then the rate limiter.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if let Some(ticker) = self.inner.ticker.lock().await.take() {
            ticker.shutdown.cancel();
            if let Err(e) = ticker.handle.await {
                warn!(error = %e, "Cleanup ticker ended abnormally");
            }
        }

        self.inner.manager.stop().await;
        self.inner.limiter.shutdown().await;
        info!("Core service stopped");
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub async fn create_job(
        &self,
        job_type: JobType,
        owner: Option<OwnerId>,
        metadata: Map<String, Value>,
    ) -> Result<JobReceipt> {
        let job = self
            .inner
            .manager
            .create_job(job_type, owner, metadata)
            .await?;
        Ok(JobReceipt::from(&job))
    }

    /// Resolve the caller's owner id and start a full sync for it.
    #[instrument(skip_all)]
    pub async fn trigger_full_sync(&self, credentials: &RequestCredentials) -> Result<JobReceipt> {
        let owner = self.inner.identity.resolve_owner(credentials).await?;
        self.create_job(JobType::FullSync, Some(owner), Map::new())
            .await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        let id = JobId::from_string(job_id)?;
        Ok(self.inner.manager.get_job(&id).await?)
    }

    pub async fn get_user_jobs(&self, owner: OwnerId, limit: Option<u32>) -> Result<Vec<Job>> {
        Ok(self.inner.manager.get_user_jobs(owner, limit).await?)
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<Job> {
        let id = JobId::from_string(job_id)?;
        Ok(self.inner.manager.cancel_job(&id).await?)
    }

    // ========================================================================
    // Maintenance & observability
    // ========================================================================

    /// Run one cleanup pass now, outside the ticker.
    pub async fn run_cleanup_now(&self) -> CleanupReport {
        self.inner.cleanup.run_full_cleanup().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.inner.events.subscribe()
    }

    /// Events of one job only (progress, completion, failure, ...).
    pub fn watch_job(&self, job_id: &str) -> EventStream {
        EventStream::for_job(self.inner.events.subscribe(), job_id)
    }

    pub async fn rate_limiter_stats(&self) -> RateLimiterStats {
        self.inner.limiter.stats().await
    }

    /// Persisted totals of provider calls since the database was created.
    pub async fn rate_limiter_usage(&self) -> Result<RateLimiterUsage> {
        Ok(self.inner.usage.get().await?)
    }
}
