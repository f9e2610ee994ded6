//! # Cleanup Service
//!
//! Periodic maintenance of the mirrored catalog and the job table, run on its
//! own ticker independent of the job manager.
//!
//! ## Steps
//!
//! Run in this order, each idempotent:
//!
//! 1. Deactivate access grants not verified within `grant_stale_after`
//! 2. Delete items whose library has no active grant
//! 3. Deactivate unmatched items that used up their matching attempts
//! 4. Delete cached mappings no active item refers to
//! 5. Recompute cached library item counts
//! 6. Delete terminal jobs older than `job_retention`
//!
//! A failing step is logged and recorded in the report; later steps still run.

use crate::JobRepository;
use bridge_traits::time::Clock;
use core_library::repositories::{
    AccessGrantRepository, ItemRepository, LibraryRepository, MappingRepository,
};
use core_runtime::config::CleanupConfig;
use core_runtime::events::{CoreEvent, EventBus, MaintenanceEvent};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Result of one cleanup step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    /// Rows changed; zero when the step failed.
    pub changes: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub steps: Vec<StepReport>,
}

impl CleanupReport {
    pub fn total_changes(&self) -> u64 {
        self.steps.iter().map(|s| s.changes).sum()
    }

    pub fn failed_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.error.is_some())
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|s| s.error.is_none())
    }

    pub fn changes_for(&self, name: &str) -> Option<u64> {
        self.steps.iter().find(|s| s.name == name).map(|s| s.changes)
    }
}

pub struct CleanupService {
    grants: Arc<dyn AccessGrantRepository>,
    items: Arc<dyn ItemRepository>,
    mappings: Arc<dyn MappingRepository>,
    libraries: Arc<dyn LibraryRepository>,
    jobs: Arc<dyn JobRepository>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: CleanupConfig,
    max_match_attempts: u32,
}

impl CleanupService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        grants: Arc<dyn AccessGrantRepository>,
        items: Arc<dyn ItemRepository>,
        mappings: Arc<dyn MappingRepository>,
        libraries: Arc<dyn LibraryRepository>,
        jobs: Arc<dyn JobRepository>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        config: CleanupConfig,
        max_match_attempts: u32,
    ) -> Self {
        Self {
            grants,
            items,
            mappings,
            libraries,
            jobs,
            events,
            clock,
            config,
            max_match_attempts,
        }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Run every step once.
    #[instrument(skip(self))]
    pub async fn run_full_cleanup(&self) -> CleanupReport {
        let now = self.clock.unix_timestamp();
        let grant_cutoff = now - secs(self.config.grant_stale_after);
        let job_cutoff = now - secs(self.config.job_retention);

        let mut report = CleanupReport::default();

        run_step(&mut report, "deactivate_stale_grants", async {
            self.grants
                .deactivate_stale(grant_cutoff, now)
                .await
                .map_err(|e| e.to_string())
        })
        .await;

        run_step(&mut report, "delete_ungranted_items", async {
            self.items
                .delete_without_active_grant()
                .await
                .map_err(|e| e.to_string())
        })
        .await;

        run_step(&mut report, "deactivate_exhausted_items", async {
            self.items
                .deactivate_exhausted(self.max_match_attempts, now)
                .await
                .map_err(|e| e.to_string())
        })
        .await;

        run_step(&mut report, "delete_orphan_mappings", async {
            self.mappings
                .delete_orphans()
                .await
                .map_err(|e| e.to_string())
        })
        .await;

        run_step(&mut report, "recompute_item_counts", async {
            self.libraries
                .recompute_item_counts()
                .await
                .map_err(|e| e.to_string())
        })
        .await;

        run_step(&mut report, "delete_expired_jobs", async {
            self.jobs
                .delete_terminal_before(job_cutoff)
                .await
                .map_err(|e| e.to_string())
        })
        .await;

        let changes = report.total_changes();
        let failed_steps = report.failed_steps();
        info!(changes, failed = failed_steps.len(), "Cleanup pass finished");

        self.events
            .publish(CoreEvent::Maintenance(MaintenanceEvent::CleanupCompleted {
                changes,
                failed_steps,
            }));

        report
    }

    /// Run the cleanup every `interval` until `shutdown` fires. The first
    /// pass happens one interval after the call.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(interval_secs = period.as_secs(), "Cleanup ticker started");
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_full_cleanup().await;
                    }
                }
            }
            debug!("Cleanup ticker stopped");
        })
    }
}

async fn run_step<F>(report: &mut CleanupReport, name: &str, step: F)
where
    F: Future<Output = Result<u64, String>>,
{
    let step = match step.await {
        Ok(changes) => {
            debug!(step = name, changes, "Cleanup step done");
            StepReport {
                name: name.to_string(),
                changes,
                error: None,
            }
        }
        Err(message) => {
            error!(step = name, error = %message, "Cleanup step failed");
            StepReport {
                name: name.to_string(),
                changes: 0,
                error: Some(message),
            }
        }
    };
    report.steps.push(step);
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

// ============================================================================
// Tests
// ============================================================================
