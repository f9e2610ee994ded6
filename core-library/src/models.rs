//! Domain models for the mirrored external catalog
//!
//! Rows of the server, library, item, mapping, access-grant and movie tables,
//! plus the upsert payloads written during a sync.

use bridge_traits::{MovieCandidate, RemoteItem, RemoteLibraryKind};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use crate::error::LibraryError;

// =============================================================================
// Kinds
// =============================================================================

/// Content type of a library or item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Show,
    Other,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Show => "show",
            MediaKind::Other => "other",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = LibraryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "movie" => Ok(MediaKind::Movie),
            "show" => Ok(MediaKind::Show),
            "other" => Ok(MediaKind::Other),
            other => Err(LibraryError::invalid(
                "kind",
                format!("unknown media kind '{}'", other),
            )),
        }
    }
}

impl From<RemoteLibraryKind> for MediaKind {
    fn from(kind: RemoteLibraryKind) -> Self {
        match kind {
            RemoteLibraryKind::Movie => MediaKind::Movie,
            RemoteLibraryKind::Show => MediaKind::Show,
            _ => MediaKind::Other,
        }
    }
}

// =============================================================================
// Rows
// =============================================================================

/// A media server and the connection chosen for it during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ExternalServer {
    pub id: i64,
    pub machine_id: String,
    pub name: String,
    pub connection_uri: String,
    pub is_local: bool,
    pub is_relay: bool,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ExternalLibrary {
    pub id: i64,
    pub server_id: i64,
    pub library_key: String,
    pub title: String,
    pub kind: String,
    /// Cached number of active items.
    pub item_count: i64,
    pub last_synced_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ExternalLibrary {
    pub fn media_kind(&self) -> MediaKind {
        self.kind.parse().unwrap_or(MediaKind::Other)
    }

    pub fn is_movie_library(&self) -> bool {
        self.media_kind() == MediaKind::Movie
    }
}

/// One mirrored catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ExternalLibraryItem {
    pub id: i64,
    pub library_id: i64,
    pub native_key: String,
    pub guid: String,
    /// JSON array of additional GUIDs.
    pub alternate_guids: String,
    pub title: String,
    pub year: Option<i32>,
    pub kind: String,
    /// Resolved metadata-provider id.
    pub metadata_id: Option<i64>,
    pub matching_attempts: i64,
    pub last_matched_at: Option<i64>,
    pub is_active: bool,
    pub last_seen_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ExternalLibraryItem {
    pub fn alternate_guids(&self) -> Vec<String> {
        serde_json::from_str(&self.alternate_guids).unwrap_or_default()
    }

    pub fn is_matched(&self) -> bool {
        self.metadata_id.is_some()
    }
}

/// Cached GUID resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ExternalIdMapping {
    pub id: i64,
    pub guid: String,
    pub metadata_id: i64,
    pub title: String,
    pub year: Option<i32>,
    pub native_key: Option<String>,
    pub match_strategy: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UserAccessGrant {
    pub id: i64,
    pub owner_id: i64,
    pub library_id: i64,
    pub is_active: bool,
    pub last_verified_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Local copy of a metadata-provider record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Movie {
    pub id: i64,
    pub title: String,
    pub original_title: Option<String>,
    pub release_year: Option<i32>,
    pub overview: Option<String>,
    pub poster_path: Option<String>,
    pub popularity: Option<f64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RateLimiterUsage {
    pub total_requests: i64,
    pub total_retries: i64,
    pub total_failures: i64,
    pub last_request_at: Option<i64>,
}

// =============================================================================
// Upsert payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUpsert {
    pub machine_id: String,
    pub name: String,
    pub connection_uri: String,
    pub is_local: bool,
    pub is_relay: bool,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryUpsert {
    pub server_id: i64,
    pub library_key: String,
    pub title: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUpsert {
    pub library_id: i64,
    pub native_key: String,
    pub guid: String,
    pub alternate_guids: Vec<String>,
    pub title: String,
    pub year: Option<i32>,
    pub kind: MediaKind,
}

impl ItemUpsert {
    pub fn from_remote(library_id: i64, item: &RemoteItem) -> Self {
        Self {
            library_id,
            native_key: item.native_key.clone(),
            guid: item.guid.clone(),
            alternate_guids: item.alternate_guids.clone(),
            title: item.title.clone(),
            year: item.year,
            kind: item.kind.into(),
        }
    }

    pub fn validate(&self) -> Result<(), LibraryError> {
        if self.native_key.trim().is_empty() {
            return Err(LibraryError::invalid("native_key", "must not be empty"));
        }
        if self.guid.trim().is_empty() {
            return Err(LibraryError::invalid("guid", "must not be empty"));
        }
        if self.title.trim().is_empty() {
            return Err(LibraryError::invalid("title", "must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingUpsert {
    pub guid: String,
    pub metadata_id: i64,
    pub title: String,
    pub year: Option<i32>,
    pub native_key: Option<String>,
    pub match_strategy: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMovie {
    pub id: i64,
    pub title: String,
    pub original_title: Option<String>,
    pub release_year: Option<i32>,
    pub overview: Option<String>,
    pub poster_path: Option<String>,
    pub popularity: Option<f64>,
}

impl From<&MovieCandidate> for NewMovie {
    fn from(candidate: &MovieCandidate) -> Self {
        Self {
            id: candidate.id,
            title: candidate.title.clone(),
            original_title: candidate.original_title.clone(),
            release_year: candidate.release_year,
            overview: candidate.overview.clone(),
            poster_path: candidate.poster_path.clone(),
            popularity: candidate.popularity,
        }
    }
}
