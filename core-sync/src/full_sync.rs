//! # Full Sync Processor
//!
//! Mirrors everything an owner can access on their media servers and matches
//! the mirrored movies to metadata provider ids.
//!
//! ## Phases
//!
//! | Phase     | Progress | Work                                                   |
//! |-----------|----------|--------------------------------------------------------|
//! | Discovery | 10-20    | servers, best connection, libraries, access grants     |
//! | Items     | 20-80    | page through movie libraries, upsert every item        |
//! | Matching  | 80-95    | resolve unmatched items through the ID matcher         |
//! | Cleanup   | 95-100   | deactivate items not seen during this run              |
//!
//! ## Failure policy
//!
//! - No account token, or a failed server listing, fails the job.
//! - A server whose libraries cannot be listed is skipped; the job only fails
//!   if every server fails.
//! - A failed page ends that library's sync; a failed item or match is
//!   counted and the run goes on.
//!
//! The job counters count mirrored items. Match results go to the
//! `ItemMatched` events and the matching step text.
//!
//! Cancellation is checked once per server, page, item and match.

use crate::processor::{JobContext, JobProcessor};
use crate::{Job, JobCounters, ProgressUpdate, Result, SyncError};
use async_trait::async_trait;
use bridge_traits::time::Clock;
use bridge_traits::{
    BridgeError, ExternalAccountStore, ExternalLibraryClient, OwnerId, RemoteServer,
    ServerConnection,
};
use core_library::models::{
    ExternalLibrary, ExternalLibraryItem, ItemUpsert, LibraryUpsert, ServerUpsert,
};
use core_library::repositories::{
    AccessGrantRepository, ItemRepository, LibraryRepository, ServerRepository,
    SqliteAccessGrantRepository, SqliteItemRepository, SqliteLibraryRepository,
    SqliteServerRepository,
};
use core_metadata::{IdMatcher, MatchOutcome, MetadataError};
use core_runtime::config::SyncConfig;
use core_runtime::events::{CoreEvent, LibraryEvent};
use core_runtime::logging::strip_query;
use futures::stream::{self, StreamExt};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const DISCOVERY_START: u8 = 10;
const ITEMS_START: u8 = 20;
const MATCHING_START: u8 = 80;
const CLEANUP_START: u8 = 95;

/// Catalog repositories the processor writes to.
#[derive(Clone)]
pub struct SyncRepositories {
    pub servers: Arc<dyn ServerRepository>,
    pub libraries: Arc<dyn LibraryRepository>,
    pub items: Arc<dyn ItemRepository>,
    pub grants: Arc<dyn AccessGrantRepository>,
}

impl SyncRepositories {
    pub fn sqlite(pool: SqlitePool) -> Self {
        Self {
            servers: Arc::new(SqliteServerRepository::new(pool.clone())),
            libraries: Arc::new(SqliteLibraryRepository::new(pool.clone())),
            items: Arc::new(SqliteItemRepository::new(pool.clone())),
            grants: Arc::new(SqliteAccessGrantRepository::new(pool)),
        }
    }
}

/// A library found during discovery with the path used to reach it.
#[derive(Debug, Clone)]
struct DiscoveredLibrary {
    library: ExternalLibrary,
    connection: ServerConnection,
    token: String,
}

/// Running totals of a run. The job counters describe mirrored items only;
/// match results are tracked beside them.
#[derive(Debug, Default)]
struct Tally {
    counters: JobCounters,
    matched: u64,
    unmatched: u64,
}

impl Tally {
    fn succeeded(&mut self) {
        self.counters.total += 1;
        self.counters.processed += 1;
        self.counters.successful += 1;
    }

    fn failed(&mut self) {
        self.counters.total += 1;
        self.counters.processed += 1;
        self.counters.failed += 1;
    }
}

pub struct SyncProcessor {
    accounts: Arc<dyn ExternalAccountStore>,
    client: Arc<dyn ExternalLibraryClient>,
    repositories: SyncRepositories,
    matcher: Arc<IdMatcher>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl SyncProcessor {
    pub fn new(
        accounts: Arc<dyn ExternalAccountStore>,
        client: Arc<dyn ExternalLibraryClient>,
        repositories: SyncRepositories,
        matcher: Arc<IdMatcher>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            accounts,
            client,
            repositories,
            matcher,
            clock,
            config,
        }
    }

    async fn account_token(&self, owner: OwnerId) -> Result<String> {
        match self.accounts.access_token(owner).await {
            Ok(Some(token)) if !token.is_empty() => Ok(token),
            Ok(_) => Err(SyncError::MissingCredentials(format!(
                "Owner {} has no connected external account",
                owner
            ))),
            Err(BridgeError::MissingCredentials(message)) => {
                Err(SyncError::MissingCredentials(message))
            }
            Err(e) => Err(SyncError::Discovery(format!(
                "Failed to load account token: {}",
                e
            ))),
        }
    }

    // ========================================================================
    // Phase 1: Discovery
    // ========================================================================

    #[instrument(skip(self, job, ctx, account_token), fields(job_id = %job.id))]
    async fn discover(
        &self,
        job: &Job,
        owner: OwnerId,
        account_token: &str,
        ctx: &JobContext,
    ) -> Result<Vec<DiscoveredLibrary>> {
        ctx.report(ProgressUpdate::new(DISCOVERY_START, "Discovering servers"))
            .await?;

        let servers = self
            .client
            .list_servers(account_token)
            .await
            .map_err(|e| SyncError::Discovery(format!("Failed to list servers: {}", e)))?;
        info!(servers = servers.len(), "Servers discovered");

        let mut discovered = Vec::new();
        let mut failed_servers = 0usize;

        for server in &servers {
            ctx.check_cancelled()?;

            let token = server
                .access_token
                .clone()
                .unwrap_or_else(|| account_token.to_string());

            let Some(connection) = select_connection(self.client.as_ref(), server, &token).await
            else {
                warn!(server = %server.machine_id, "Server has no connections, skipping");
                failed_servers += 1;
                continue;
            };

            let remote_libraries = match self.client.list_libraries(&connection, &token).await {
                Ok(libraries) => libraries,
                Err(e) => {
                    warn!(server = %server.machine_id, error = %e, "Failed to list libraries");
                    failed_servers += 1;
                    continue;
                }
            };

            let now = self.clock.unix_timestamp();
            let stored_server = self
                .repositories
                .servers
                .upsert(
                    &ServerUpsert {
                        machine_id: server.machine_id.clone(),
                        name: server.name.clone(),
                        connection_uri: connection.uri.clone(),
                        is_local: connection.local,
                        is_relay: connection.relay,
                        access_token: server.access_token.clone(),
                    },
                    now,
                )
                .await?;

            for remote in remote_libraries {
                let library = self
                    .repositories
                    .libraries
                    .upsert(
                        &LibraryUpsert {
                            server_id: stored_server.id,
                            library_key: remote.key.clone(),
                            title: remote.title.clone(),
                            kind: remote.kind.into(),
                        },
                        now,
                    )
                    .await?;
                self.repositories.grants.grant(owner, library.id, now).await?;

                ctx.events().publish(CoreEvent::Library(LibraryEvent::LibraryDiscovered {
                    job_id: job.id.to_string(),
                    server_id: server.machine_id.clone(),
                    library_key: remote.key,
                    title: remote.title,
                }));

                discovered.push(DiscoveredLibrary {
                    library,
                    connection: connection.clone(),
                    token: token.clone(),
                });
            }
        }

        if !servers.is_empty() && failed_servers == servers.len() {
            return Err(SyncError::Discovery(format!(
                "None of {} servers could be reached",
                servers.len()
            )));
        }

        ctx.report(ProgressUpdate::new(
            ITEMS_START,
            format!("Discovered {} libraries", discovered.len()),
        ))
        .await?;

        Ok(discovered)
    }

    // ========================================================================
    // Phase 2: Items
    // ========================================================================

    /// Sync every movie library. Returns the ids of libraries whose items were
    /// listed completely.
    async fn sync_items(
        &self,
        job: &Job,
        libraries: &[DiscoveredLibrary],
        tally: &mut Tally,
        ctx: &JobContext,
    ) -> Result<Vec<i64>> {
        let movie_libraries: Vec<&DiscoveredLibrary> = libraries
            .iter()
            .filter(|d| d.library.is_movie_library())
            .collect();

        let mut complete = Vec::with_capacity(movie_libraries.len());
        let span = f64::from(MATCHING_START - ITEMS_START);
        let count = movie_libraries.len().max(1) as f64;

        for (index, discovered) in movie_libraries.iter().enumerate() {
            let base = f64::from(ITEMS_START) + span * index as f64 / count;
            let share = span / count;
            if self
                .sync_library(job, discovered, base, share, tally, ctx)
                .await?
            {
                complete.push(discovered.library.id);
            }
        }

        ctx.report(
            ProgressUpdate::new(MATCHING_START, "Items synced").with_counters(tally.counters),
        )
        .await?;

        Ok(complete)
    }

    #[instrument(
        skip(self, job, discovered, tally, ctx),
        fields(job_id = %job.id, library_id = discovered.library.id)
    )]
    async fn sync_library(
        &self,
        job: &Job,
        discovered: &DiscoveredLibrary,
        base: f64,
        share: f64,
        tally: &mut Tally,
        ctx: &JobContext,
    ) -> Result<bool> {
        let library = &discovered.library;
        let page_size = self.config.page_size.max(1);
        let progress_every = self.config.progress_every.max(1);

        let mut offset = 0u64;
        let mut upserted = 0u64;
        let mut failed = 0u64;
        let mut complete = true;

        loop {
            ctx.check_cancelled()?;

            let page = match self
                .client
                .list_items(
                    &discovered.connection,
                    &discovered.token,
                    &library.library_key,
                    offset,
                    page_size,
                )
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(offset, error = %e, "Failed to list items, library left incomplete");
                    complete = false;
                    break;
                }
            };

            let fetched = page.items.len() as u64;
            for remote in &page.items {
                ctx.check_cancelled()?;

                let upsert = ItemUpsert::from_remote(library.id, remote);
                let result = match upsert.validate() {
                    Ok(()) => self
                        .repositories
                        .items
                        .upsert(&upsert, self.clock.unix_timestamp())
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                };

                match result {
                    Ok(()) => {
                        upserted += 1;
                        tally.succeeded();
                    }
                    Err(e) => {
                        debug!(native_key = %remote.native_key, error = %e, "Item upsert failed");
                        failed += 1;
                        tally.failed();
                    }
                }

                let seen = upserted + failed;
                if seen % progress_every == 0 {
                    let fraction = match page.total {
                        Some(total) if total > 0 => (seen as f64 / total as f64).min(1.0),
                        _ => 0.0,
                    };
                    ctx.report(
                        ProgressUpdate::new(
                            (base + share * fraction) as u8,
                            format!("Syncing {}", library.title),
                        )
                        .with_counters(tally.counters),
                    )
                    .await?;
                }
            }

            offset += fetched;
            let exhausted = match page.total {
                Some(total) => offset >= total,
                None => false,
            };
            if fetched < page_size || exhausted {
                break;
            }
        }

        let now = self.clock.unix_timestamp();
        let item_count = self
            .repositories
            .libraries
            .refresh_item_count(library.id, now)
            .await?;
        if complete {
            self.repositories.libraries.mark_synced(library.id, now).await?;
        }

        info!(upserted, failed, item_count, complete, "Library synced");
        ctx.events().publish(CoreEvent::Library(LibraryEvent::ItemsSynced {
            job_id: job.id.to_string(),
            library_id: library.id,
            upserted,
            failed,
        }));

        Ok(complete)
    }

    // ========================================================================
    // Phase 3: Matching
    // ========================================================================

    #[instrument(skip(self, job, tally, ctx), fields(job_id = %job.id))]
    async fn match_items(
        &self,
        job: &Job,
        owner: OwnerId,
        tally: &mut Tally,
        ctx: &JobContext,
    ) -> Result<()> {
        let matching = self.matcher.config();
        let candidates = self
            .repositories
            .items
            .find_matchable(owner, matching.max_attempts)
            .await?;

        if candidates.is_empty() {
            debug!("No items to match");
            return Ok(());
        }
        info!(candidates = candidates.len(), "Matching items");

        let total = candidates.len() as u64;
        let progress_every = self.config.progress_every.max(1);
        let span = f64::from(CLEANUP_START - MATCHING_START);
        let cancel = ctx.cancel_token();

        let pending: Vec<_> = candidates
            .iter()
            .map(|item| self.match_one(item, cancel))
            .collect();
        let mut results = stream::iter(pending).buffer_unordered(matching.concurrency.max(1));

        let mut done = 0u64;
        while let Some((item, result)) = results.next().await {
            match result {
                Ok(Some(outcome)) => {
                    tally.matched += 1;
                    ctx.events().publish(CoreEvent::Library(LibraryEvent::ItemMatched {
                        item_id: item.id,
                        metadata_id: outcome.metadata_id,
                        strategy: outcome.strategy.to_string(),
                    }));
                }
                Ok(None) => tally.unmatched += 1,
                Err(MetadataError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    warn!(item_id = item.id, error = %e, "Matching failed");
                    tally.unmatched += 1;
                }
            }

            done += 1;
            if done % progress_every == 0 || done == total {
                let progress = f64::from(MATCHING_START) + span * done as f64 / total as f64;
                ctx.report(
                    ProgressUpdate::new(
                        progress as u8,
                        format!("Matched {} of {} ({} found)", done, total, tally.matched),
                    )
                    .with_counters(tally.counters),
                )
                .await?;
            }
        }

        info!(
            matched = tally.matched,
            unmatched = tally.unmatched,
            "Matching finished"
        );
        Ok(())
    }

    async fn match_one<'a>(
        &self,
        item: &'a ExternalLibraryItem,
        cancel: &CancellationToken,
    ) -> (&'a ExternalLibraryItem, std::result::Result<Option<MatchOutcome>, MetadataError>) {
        if cancel.is_cancelled() {
            return (item, Err(MetadataError::Cancelled));
        }
        (item, self.matcher.match_item(item, cancel).await)
    }
}

#[async_trait]
impl JobProcessor for SyncProcessor {
    #[instrument(skip(self, job, ctx), fields(job_id = %job.id))]
    async fn process(&self, job: &Job, ctx: &JobContext) -> Result<JobCounters> {
        let owner = job
            .owner_id
            .ok_or_else(|| SyncError::Validation("full sync job has no owner".to_string()))?;
        let run_started_at = self.clock.unix_timestamp();

        let account_token = self.account_token(owner).await?;

        let libraries = self.discover(job, owner, &account_token, ctx).await?;

        let mut tally = Tally::default();
        let complete = self.sync_items(job, &libraries, &mut tally, ctx).await?;

        ctx.check_cancelled()?;
        self.match_items(job, owner, &mut tally, ctx).await?;

        ctx.check_cancelled()?;
        ctx.report(
            ProgressUpdate::new(CLEANUP_START, "Deactivating stale items")
                .with_counters(tally.counters),
        )
        .await?;
        let deactivated = self
            .repositories
            .items
            .deactivate_unseen(&complete, run_started_at)
            .await?;
        if deactivated > 0 {
            let now = self.clock.unix_timestamp();
            for library_id in &complete {
                self.repositories
                    .libraries
                    .refresh_item_count(*library_id, now)
                    .await?;
            }
        }
        info!(deactivated, "Stale items deactivated");

        Ok(tally.counters)
    }
}

// ============================================================================
// Connection selection
// ============================================================================

fn preference_rank(connection: &ServerConnection) -> u8 {
    match (connection.relay, connection.local) {
        (false, false) => 0,
        (false, true) => 1,
        (true, _) => 2,
    }
}

/// Pick the first reachable connection in preference order (direct remote,
/// then local, then relay). Falls back to the first listed connection when
/// none answers.
async fn select_connection(
    client: &dyn ExternalLibraryClient,
    server: &RemoteServer,
    token: &str,
) -> Option<ServerConnection> {
    let mut ranked: Vec<&ServerConnection> = server.connections.iter().collect();
    ranked.sort_by_key(|c| preference_rank(c));

    for connection in ranked {
        if client.check_connection(connection, token).await {
            debug!(server = %server.machine_id, uri = strip_query(&connection.uri), "Connection selected");
            return Some(connection.clone());
        }
    }

    let fallback = server.connections.first().cloned();
    if let Some(connection) = &fallback {
        debug!(server = %server.machine_id, uri = strip_query(&connection.uri), "No connection answered, using first");
    }
    fallback
}
