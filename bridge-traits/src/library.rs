//! External Library Client
//!
//! Narrow call contract for the user's media-server catalog. Only the four
//! operations the sync engine needs are modelled; the wire protocol belongs to
//! the host implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One network path to a media server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConnection {
    pub uri: String,
    /// Address on the server's own LAN.
    pub local: bool,
    /// Traffic goes through the vendor's relay.
    pub relay: bool,
}

impl ServerConnection {
    pub fn remote(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            local: false,
            relay: false,
        }
    }

    pub fn local(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            local: true,
            relay: false,
        }
    }

    pub fn relayed(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            local: false,
            relay: true,
        }
    }
}

/// A media server the owner can access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteServer {
    /// Stable machine identifier.
    pub machine_id: String,
    pub name: String,
    /// Server-scoped token; falls back to the account token when absent.
    pub access_token: Option<String>,
    pub owned: bool,
    pub connections: Vec<ServerConnection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteLibraryKind {
    Movie,
    Show,
    Artist,
    Photo,
    Other,
}

impl RemoteLibraryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteLibraryKind::Movie => "movie",
            RemoteLibraryKind::Show => "show",
            RemoteLibraryKind::Artist => "artist",
            RemoteLibraryKind::Photo => "photo",
            RemoteLibraryKind::Other => "other",
        }
    }
}

/// A library section on a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLibrary {
    /// Section key, stable within a server.
    pub key: String,
    pub title: String,
    pub kind: RemoteLibraryKind,
}

/// A single catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    /// Native item key, stable within a library.
    pub native_key: String,
    pub title: String,
    pub year: Option<i32>,
    pub kind: RemoteLibraryKind,
    /// Primary GUID, possibly encoding a foreign id.
    pub guid: String,
    /// Additional GUIDs some agents emit (`imdb://…`, `tmdb://…`).
    pub alternate_guids: Vec<String>,
}

/// One page of [`RemoteItem`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPage {
    pub items: Vec<RemoteItem>,
    /// Total number of items in the library, when the server reports it.
    pub total: Option<u64>,
}

/// Media-server catalog operations.
///
/// # Example
///
/// ```ignore
/// let servers = client.list_servers(&account_token).await?;
/// for server in servers {
///     let connection = &server.connections[0];
///     let libraries = client.list_libraries(connection, &account_token).await?;
/// }
/// ```
#[async_trait]
pub trait ExternalLibraryClient: Send + Sync {
    /// List servers reachable with the account token.
    async fn list_servers(&self, account_token: &str) -> Result<Vec<RemoteServer>>;

    /// Probe a connection. Implementations should answer quickly and treat any
    /// transport failure as `false` rather than an error.
    async fn check_connection(&self, connection: &ServerConnection, token: &str) -> bool;

    async fn list_libraries(
        &self,
        connection: &ServerConnection,
        token: &str,
    ) -> Result<Vec<RemoteLibrary>>;

    /// List items of a library, `limit` at a time starting at `offset`.
    async fn list_items(
        &self,
        connection: &ServerConnection,
        token: &str,
        library_key: &str,
        offset: u64,
        limit: u64,
    ) -> Result<ItemPage>;
}
