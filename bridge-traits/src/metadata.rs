//! Metadata Provider Client
//!
//! The third-party catalog supplying canonical movie metadata. Inside the core
//! every call to this trait is funnelled through the shared rate limiter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Foreign catalogs the provider can look up by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalSource {
    Imdb,
    Tvdb,
}

impl ExternalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalSource::Imdb => "imdb_id",
            ExternalSource::Tvdb => "tvdb_id",
        }
    }
}

/// A movie as returned by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieCandidate {
    pub id: i64,
    pub title: String,
    pub original_title: Option<String>,
    pub release_year: Option<i32>,
    pub overview: Option<String>,
    pub poster_path: Option<String>,
    pub popularity: Option<f64>,
}

impl MovieCandidate {
    pub fn new(id: i64, title: impl Into<String>, release_year: Option<i32>) -> Self {
        Self {
            id,
            title: title.into(),
            original_title: None,
            release_year,
            overview: None,
            poster_path: None,
            popularity: None,
        }
    }
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Search by title. Results are ordered by relevance; `year` narrows the
    /// search when the provider supports it.
    async fn search_movies(&self, title: &str, year: Option<i32>) -> Result<Vec<MovieCandidate>>;

    /// Fetch one movie by provider id. `Ok(None)` when it does not exist.
    async fn get_movie(&self, id: i64) -> Result<Option<MovieCandidate>>;

    async fn find_by_external_id(
        &self,
        external_id: &str,
        source: ExternalSource,
    ) -> Result<Vec<MovieCandidate>>;
}
