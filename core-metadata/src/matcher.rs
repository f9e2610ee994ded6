//! # ID Matcher
//!
//! Resolves an external item GUID to a metadata provider id.
//!
//! ## Resolution order
//!
//! 1. In-memory LRU cache, then the persisted `external_id_mappings` table
//! 2. For the primary GUID and then each alternate GUID:
//!    - a directly encoded provider id, accepted when the movie exists locally
//!      or the provider confirms it
//!    - a foreign catalog id (IMDb, TVDB), resolved with a find-by-external-id
//!      lookup, first candidate wins
//! 3. Title search, preferring a candidate released in the item's year, else
//!    the most relevant result
//!
//! Every accepted match is backed by a local movie row (created on demand) and
//! written to the mapping cache under the primary GUID. All provider calls go
//! through the shared [`RateLimiter`] at [`Priority::Low`].

use bridge_traits::time::Clock;
use bridge_traits::{MetadataProvider, MovieCandidate};
use core_library::models::{ExternalLibraryItem, MappingUpsert, NewMovie};
use core_library::repositories::{ItemRepository, MappingRepository, MovieRepository};
use core_runtime::config::MatchingConfig;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{MetadataError, Result};
use crate::guid::ParsedGuid;
use crate::rate_limiter::{Priority, RateLimiter};

/// How a match was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Cached,
    DirectId,
    ExternalId,
    TitleSearch,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::Cached => "cached",
            MatchStrategy::DirectId => "direct_id",
            MatchStrategy::ExternalId => "external_id",
            MatchStrategy::TitleSearch => "title_search",
        }
    }
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub metadata_id: i64,
    pub strategy: MatchStrategy,
}

/// What is known about the item being resolved.
#[derive(Debug, Clone, Copy)]
pub struct MatchQuery<'a> {
    pub guid: &'a str,
    pub alternate_guids: &'a [String],
    pub title: &'a str,
    pub year: Option<i32>,
    pub native_key: Option<&'a str>,
}

impl<'a> MatchQuery<'a> {
    pub fn new(guid: &'a str, title: &'a str, year: Option<i32>) -> Self {
        Self {
            guid,
            alternate_guids: &[],
            title,
            year,
            native_key: None,
        }
    }

    pub fn with_alternates(mut self, alternate_guids: &'a [String]) -> Self {
        self.alternate_guids = alternate_guids;
        self
    }
}

pub struct IdMatcher {
    limiter: Arc<RateLimiter>,
    provider: Arc<dyn MetadataProvider>,
    mappings: Arc<dyn MappingRepository>,
    movies: Arc<dyn MovieRepository>,
    items: Arc<dyn ItemRepository>,
    clock: Arc<dyn Clock>,
    cache: Mutex<LruCache<String, i64>>,
    config: MatchingConfig,
}

impl IdMatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        limiter: Arc<RateLimiter>,
        provider: Arc<dyn MetadataProvider>,
        mappings: Arc<dyn MappingRepository>,
        movies: Arc<dyn MovieRepository>,
        items: Arc<dyn ItemRepository>,
        clock: Arc<dyn Clock>,
        config: MatchingConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            limiter,
            provider,
            mappings,
            movies,
            items,
            clock,
            cache: Mutex::new(LruCache::new(capacity)),
            config,
        }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// Resolve one stored item and record the outcome on it.
    ///
    /// A match sets the item's metadata id. No match, or an error other than
    /// cancellation, counts as a failed attempt.
    #[instrument(skip(self, item, cancel), fields(item_id = item.id, guid = %item.guid))]
    pub async fn match_item(
        &self,
        item: &ExternalLibraryItem,
        cancel: &CancellationToken,
    ) -> Result<Option<MatchOutcome>> {
        let alternates = item.alternate_guids();
        let query = MatchQuery {
            guid: &item.guid,
            alternate_guids: &alternates,
            title: &item.title,
            year: item.year,
            native_key: Some(&item.native_key),
        };

        let result = self.resolve(query, cancel).await;
        let now = self.clock.unix_timestamp();

        match result {
            Ok(Some(outcome)) => {
                self.items.set_match(item.id, outcome.metadata_id, now).await?;
                Ok(Some(outcome))
            }
            Ok(None) => {
                debug!("No match found");
                self.items.record_failed_match(item.id, now).await?;
                Ok(None)
            }
            Err(MetadataError::Cancelled) => Err(MetadataError::Cancelled),
            Err(e) => {
                self.items.record_failed_match(item.id, now).await?;
                Err(e)
            }
        }
    }

    /// Resolve a GUID to a metadata id without touching item state.
    #[instrument(skip(self, query, cancel), fields(guid = %query.guid))]
    pub async fn resolve(
        &self,
        query: MatchQuery<'_>,
        cancel: &CancellationToken,
    ) -> Result<Option<MatchOutcome>> {
        if let Some(metadata_id) = self.cached(query.guid).await? {
            return Ok(Some(MatchOutcome {
                metadata_id,
                strategy: MatchStrategy::Cached,
            }));
        }

        let guids = std::iter::once(query.guid).chain(query.alternate_guids.iter().map(String::as_str));
        for guid in guids {
            if cancel.is_cancelled() {
                return Err(MetadataError::Cancelled);
            }
            if let Some(outcome) = self.resolve_guid(guid, cancel).await? {
                self.remember(&query, outcome).await?;
                return Ok(Some(outcome));
            }
        }

        if query.title.trim().is_empty() {
            return Ok(None);
        }

        let Some(candidate) = self.search_by_title(query.title, query.year, cancel).await? else {
            return Ok(None);
        };
        self.movies
            .upsert(&NewMovie::from(&candidate), self.clock.unix_timestamp())
            .await?;

        let outcome = MatchOutcome {
            metadata_id: candidate.id,
            strategy: MatchStrategy::TitleSearch,
        };
        self.remember(&query, outcome).await?;
        Ok(Some(outcome))
    }

    async fn cached(&self, guid: &str) -> Result<Option<i64>> {
        if let Some(metadata_id) = self.cache.lock().await.get(guid) {
            return Ok(Some(*metadata_id));
        }

        let Some(mapping) = self.mappings.find_by_guid(guid).await? else {
            return Ok(None);
        };
        self.cache
            .lock()
            .await
            .put(guid.to_string(), mapping.metadata_id);
        Ok(Some(mapping.metadata_id))
    }

    /// Try the id-based strategies for one GUID.
    ///
    /// Provider failures here are not fatal: the caller falls through to the
    /// next GUID or to title search.
    async fn resolve_guid(
        &self,
        guid: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<MatchOutcome>> {
        let parsed = ParsedGuid::parse(guid);

        let attempt = if let Some(id) = parsed.metadata_id() {
            self.verify_direct_id(id, cancel)
                .await
                .map(|found| found.map(|id| (id, MatchStrategy::DirectId)))
        } else if parsed.external_id().is_some() {
            self.find_by_external_id(&parsed, cancel)
                .await
                .map(|found| found.map(|id| (id, MatchStrategy::ExternalId)))
        } else {
            return Ok(None);
        };

        match attempt {
            Ok(Some((metadata_id, strategy))) => Ok(Some(MatchOutcome {
                metadata_id,
                strategy,
            })),
            Ok(None) => Ok(None),
            Err(e @ (MetadataError::Cancelled | MetadataError::Shutdown)) => Err(e),
            Err(e) => {
                warn!(guid, error = %e, "Id lookup failed, falling back");
                Ok(None)
            }
        }
    }

    async fn verify_direct_id(&self, id: i64, cancel: &CancellationToken) -> Result<Option<i64>> {
        if self.movies.exists(id).await? {
            return Ok(Some(id));
        }

        let movie = self
            .limiter
            .execute_with_rate_limit(Priority::Low, cancel, || self.provider.get_movie(id))
            .await?;

        match movie {
            Some(candidate) => {
                self.movies
                    .upsert(&NewMovie::from(&candidate), self.clock.unix_timestamp())
                    .await?;
                Ok(Some(candidate.id))
            }
            None => Ok(None),
        }
    }

    async fn find_by_external_id(
        &self,
        parsed: &ParsedGuid,
        cancel: &CancellationToken,
    ) -> Result<Option<i64>> {
        let Some((external_id, source)) = parsed.external_id() else {
            return Ok(None);
        };

        let candidates = self
            .limiter
            .execute_with_rate_limit(Priority::Low, cancel, || {
                self.provider.find_by_external_id(external_id, source)
            })
            .await?;

        match candidates.into_iter().next() {
            Some(candidate) => {
                self.movies
                    .upsert(&NewMovie::from(&candidate), self.clock.unix_timestamp())
                    .await?;
                Ok(Some(candidate.id))
            }
            None => Ok(None),
        }
    }

    async fn search_by_title(
        &self,
        title: &str,
        year: Option<i32>,
        cancel: &CancellationToken,
    ) -> Result<Option<MovieCandidate>> {
        let candidates = self
            .limiter
            .execute_with_rate_limit(Priority::Low, cancel, || {
                self.provider.search_movies(title, year)
            })
            .await?;

        Ok(pick_candidate(candidates, year))
    }

    async fn remember(&self, query: &MatchQuery<'_>, outcome: MatchOutcome) -> Result<()> {
        let mapping = MappingUpsert {
            guid: query.guid.to_string(),
            metadata_id: outcome.metadata_id,
            title: query.title.to_string(),
            year: query.year,
            native_key: query.native_key.map(str::to_string),
            match_strategy: outcome.strategy.as_str().to_string(),
        };
        self.mappings
            .upsert(&mapping, self.clock.unix_timestamp())
            .await?;
        self.cache
            .lock()
            .await
            .put(query.guid.to_string(), outcome.metadata_id);
        Ok(())
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

/// Exact release-year match if there is one, else the most relevant result.
fn pick_candidate(candidates: Vec<MovieCandidate>, year: Option<i32>) -> Option<MovieCandidate> {
    if let Some(year) = year {
        if let Some(index) = candidates
            .iter()
            .position(|c| c.release_year == Some(year))
        {
            return candidates.into_iter().nth(index);
        }
    }
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::time::ManualClock;
    use bridge_traits::ExternalSource;
    use core_library::db::create_test_pool;
    use core_library::models::{ItemUpsert, MediaKind};
    use core_library::repositories::{
        SqliteItemRepository, SqliteMappingRepository, SqliteMovieRepository,
    };
    use core_runtime::config::RateLimitConfig;
    use mockall::mock;
    use sqlx::SqlitePool;
    use std::time::Duration;

    mock! {
        pub Provider {}

        #[async_trait]
        impl MetadataProvider for Provider {
            async fn search_movies(&self, title: &str, year: Option<i32>) -> BridgeResult<Vec<MovieCandidate>>;
            async fn get_movie(&self, id: i64) -> BridgeResult<Option<MovieCandidate>>;
            async fn find_by_external_id(&self, external_id: &str, source: ExternalSource) -> BridgeResult<Vec<MovieCandidate>>;
        }
    }

    struct Fixture {
        pool: SqlitePool,
        matcher: IdMatcher,
    }

    async fn fixture(provider: MockProvider) -> Fixture {
        let pool = create_test_pool().await.unwrap();
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::new(100, Duration::from_millis(10))
                .with_retries(1, Duration::from_millis(10)),
        ));
        let matcher = IdMatcher::new(
            limiter,
            Arc::new(provider),
            Arc::new(SqliteMappingRepository::new(pool.clone())),
            Arc::new(SqliteMovieRepository::new(pool.clone())),
            Arc::new(SqliteItemRepository::new(pool.clone())),
            Arc::new(ManualClock::default()),
            MatchingConfig::default(),
        );
        Fixture { pool, matcher }
    }

    async fn insert_movie(pool: &SqlitePool, id: i64, title: &str) {
        sqlx::query("INSERT INTO movies (id, title, created_at, updated_at) VALUES (?, ?, 0, 0)")
            .bind(id)
            .bind(title)
            .execute(pool)
            .await
            .unwrap();
    }

    async fn movie_exists(pool: &SqlitePool, id: i64) -> bool {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM movies WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap();
        count == 1
    }

    async fn seed_item(pool: &SqlitePool, guid: &str, title: &str, year: Option<i32>) -> ExternalLibraryItem {
        sqlx::query(
            "INSERT INTO external_servers (machine_id, name, connection_uri, created_at, updated_at) \
             VALUES ('m', 'S', 'https://s', 0, 0)",
        )
        .execute(pool)
        .await
        .unwrap();
        let (library_id,): (i64,) = sqlx::query_as(
            "INSERT INTO external_libraries (server_id, library_key, title, kind, created_at, updated_at) \
             SELECT id, '1', 'Movies', 'movie', 0, 0 FROM external_servers RETURNING id",
        )
        .fetch_one(pool)
        .await
        .unwrap();
        let upsert = ItemUpsert {
            library_id,
            native_key: "100".to_string(),
            guid: guid.to_string(),
            alternate_guids: vec![],
            title: title.to_string(),
            year,
            kind: MediaKind::Movie,
        };
        SqliteItemRepository::new(pool.clone())
            .upsert(&upsert, 0)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_direct_id_for_local_movie_skips_provider() {
        // No expectations: any provider call panics.
        let f = fixture(MockProvider::new()).await;
        insert_movie(&f.pool, 603, "The Matrix").await;

        let outcome = f
            .matcher
            .resolve(
                MatchQuery::new("tmdb://603", "The Matrix", Some(1999)),
                &CancellationToken::new(),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.metadata_id, 603);
        assert_eq!(outcome.strategy, MatchStrategy::DirectId);
    }

    #[tokio::test]
    async fn test_direct_id_confirmed_by_provider_is_created_locally() {
        let mut provider = MockProvider::new();
        provider
            .expect_get_movie()
            .withf(|id| *id == 603)
            .times(1)
            .returning(|id| Ok(Some(MovieCandidate::new(id, "The Matrix", Some(1999)))));
        let f = fixture(provider).await;

        let outcome = f
            .matcher
            .resolve(
                MatchQuery::new("com.plexapp.agents.themoviedb://603?lang=en", "The Matrix", None),
                &CancellationToken::new(),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.metadata_id, 603);
        assert!(movie_exists(&f.pool, 603).await);
    }

    #[tokio::test]
    async fn test_same_guid_resolves_identically_from_cache() {
        let mut provider = MockProvider::new();
        provider
            .expect_search_movies()
            .times(1)
            .returning(|_, _| Ok(vec![MovieCandidate::new(949, "Heat", Some(1995))]));
        let f = fixture(provider).await;
        let cancel = CancellationToken::new();
        let query = MatchQuery::new("plex://movie/5d7768", "Heat", Some(1995));

        let first = f.matcher.resolve(query, &cancel).await.unwrap().unwrap();
        let second = f.matcher.resolve(query, &cancel).await.unwrap().unwrap();

        assert_eq!(first.metadata_id, second.metadata_id);
        assert_eq!(first.strategy, MatchStrategy::TitleSearch);
        assert_eq!(second.strategy, MatchStrategy::Cached);
    }

    #[tokio::test]
    async fn test_persisted_mapping_survives_a_new_matcher() {
        let mut provider = MockProvider::new();
        provider
            .expect_search_movies()
            .times(1)
            .returning(|_, _| Ok(vec![MovieCandidate::new(949, "Heat", Some(1995))]));
        let f = fixture(provider).await;
        let cancel = CancellationToken::new();
        let query = MatchQuery::new("plex://movie/5d7768", "Heat", Some(1995));
        f.matcher.resolve(query, &cancel).await.unwrap();

        let fresh = IdMatcher::new(
            Arc::new(RateLimiter::new(RateLimitConfig::default())),
            Arc::new(MockProvider::new()),
            Arc::new(SqliteMappingRepository::new(f.pool.clone())),
            Arc::new(SqliteMovieRepository::new(f.pool.clone())),
            Arc::new(SqliteItemRepository::new(f.pool.clone())),
            Arc::new(ManualClock::default()),
            MatchingConfig::default(),
        );
        let outcome = fresh.resolve(query, &cancel).await.unwrap().unwrap();
        assert_eq!(outcome.metadata_id, 949);
        assert_eq!(outcome.strategy, MatchStrategy::Cached);
        assert_eq!(fresh.cache_len().await, 1);
    }

    #[tokio::test]
    async fn test_foreign_id_takes_first_candidate() {
        let mut provider = MockProvider::new();
        provider
            .expect_find_by_external_id()
            .withf(|id, source| id == "tt0133093" && *source == ExternalSource::Imdb)
            .times(1)
            .returning(|_, _| {
                Ok(vec![
                    MovieCandidate::new(603, "The Matrix", Some(1999)),
                    MovieCandidate::new(604, "The Matrix Reloaded", Some(2003)),
                ])
            });
        let f = fixture(provider).await;

        let outcome = f
            .matcher
            .resolve(
                MatchQuery::new("imdb://tt0133093", "The Matrix", Some(1999)),
                &CancellationToken::new(),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.metadata_id, 603);
        assert_eq!(outcome.strategy, MatchStrategy::ExternalId);
    }

    #[tokio::test]
    async fn test_alternate_guid_is_tried_after_native_primary() {
        let mut provider = MockProvider::new();
        provider
            .expect_find_by_external_id()
            .times(1)
            .returning(|_, _| Ok(vec![MovieCandidate::new(949, "Heat", Some(1995))]));
        let f = fixture(provider).await;
        let alternates = vec!["imdb://tt0113277".to_string()];

        let outcome = f
            .matcher
            .resolve(
                MatchQuery::new("plex://movie/5d7768", "Heat", Some(1995))
                    .with_alternates(&alternates),
                &CancellationToken::new(),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.metadata_id, 949);
        assert_eq!(outcome.strategy, MatchStrategy::ExternalId);
    }

    #[tokio::test]
    async fn test_title_search_prefers_exact_year() {
        let mut provider = MockProvider::new();
        provider.expect_search_movies().returning(|_, _| {
            Ok(vec![
                MovieCandidate::new(1, "Heat", Some(1986)),
                MovieCandidate::new(949, "Heat", Some(1995)),
            ])
        });
        let f = fixture(provider).await;
        let cancel = CancellationToken::new();

        let exact = f
            .matcher
            .resolve(MatchQuery::new("plex://movie/a", "Heat", Some(1995)), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exact.metadata_id, 949);

        let first = f
            .matcher
            .resolve(MatchQuery::new("plex://movie/b", "Heat", Some(2020)), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.metadata_id, 1);
    }

    #[tokio::test]
    async fn test_unknown_direct_id_falls_back_to_title_search() {
        let mut provider = MockProvider::new();
        provider.expect_get_movie().times(1).returning(|_| Ok(None));
        provider
            .expect_search_movies()
            .times(1)
            .returning(|_, _| Ok(vec![MovieCandidate::new(949, "Heat", Some(1995))]));
        let f = fixture(provider).await;

        let outcome = f
            .matcher
            .resolve(
                MatchQuery::new("tmdb://999999", "Heat", Some(1995)),
                &CancellationToken::new(),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.metadata_id, 949);
        assert_eq!(outcome.strategy, MatchStrategy::TitleSearch);
    }

    #[tokio::test]
    async fn test_provider_error_on_id_lookup_falls_back() {
        let mut provider = MockProvider::new();
        provider
            .expect_find_by_external_id()
            .returning(|_, _| Err(BridgeError::OperationFailed("500 internal".to_string())));
        provider
            .expect_search_movies()
            .returning(|_, _| Ok(vec![MovieCandidate::new(603, "The Matrix", Some(1999))]));
        let f = fixture(provider).await;

        let outcome = f
            .matcher
            .resolve(
                MatchQuery::new("imdb://tt0133093", "The Matrix", Some(1999)),
                &CancellationToken::new(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.strategy, MatchStrategy::TitleSearch);
    }

    #[tokio::test]
    async fn test_match_item_records_success() {
        let mut provider = MockProvider::new();
        provider
            .expect_search_movies()
            .returning(|_, _| Ok(vec![MovieCandidate::new(949, "Heat", Some(1995))]));
        let f = fixture(provider).await;
        let item = seed_item(&f.pool, "plex://movie/5d7768", "Heat", Some(1995)).await;

        let outcome = f
            .matcher
            .match_item(&item, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.map(|o| o.metadata_id), Some(949));

        let stored = SqliteItemRepository::new(f.pool.clone())
            .find_by_id(item.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.metadata_id, Some(949));
        assert_eq!(stored.matching_attempts, 0);
    }

    #[tokio::test]
    async fn test_match_item_counts_failed_attempts() {
        let mut provider = MockProvider::new();
        provider.expect_search_movies().returning(|_, _| Ok(vec![]));
        let f = fixture(provider).await;
        let item = seed_item(&f.pool, "plex://movie/unknown", "Nope", None).await;
        let cancel = CancellationToken::new();

        assert!(f.matcher.match_item(&item, &cancel).await.unwrap().is_none());
        assert!(f.matcher.match_item(&item, &cancel).await.unwrap().is_none());

        let stored = SqliteItemRepository::new(f.pool.clone())
            .find_by_id(item.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.matching_attempts, 2);
        assert!(stored.last_matched_at.is_some());
        assert!(stored.metadata_id.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_match_is_not_an_attempt() {
        let f = fixture(MockProvider::new()).await;
        let item = seed_item(&f.pool, "plex://movie/x", "Heat", Some(1995)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = f.matcher.match_item(&item, &cancel).await;
        assert!(matches!(result, Err(MetadataError::Cancelled)));

        let stored = SqliteItemRepository::new(f.pool.clone())
            .find_by_id(item.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.matching_attempts, 0);
    }

    #[test]
    fn test_pick_candidate_without_year() {
        let candidates = vec![
            MovieCandidate::new(1, "Heat", Some(1986)),
            MovieCandidate::new(949, "Heat", Some(1995)),
        ];
        assert_eq!(pick_candidate(candidates, None).map(|c| c.id), Some(1));
        assert!(pick_candidate(vec![], Some(1995)).is_none());
    }
}
