//! # Collaborator Bridge Traits
//!
//! Call contracts for everything the sync engine consumes but does not own.
//!
//! ## Overview
//!
//! The engine reconciles a user's external media-server catalog with a
//! third-party metadata catalog. Both sides, plus identity resolution, are
//! implemented by the host; this crate only fixes the shape of the calls.
//!
//! ## Traits
//!
//! ### Identity
//! - [`IdentityResolver`](identity::IdentityResolver) - Request credentials to owner id
//! - [`ExternalAccountStore`](identity::ExternalAccountStore) - Owner to linked library account token
//!
//! ### External Services
//! - [`ExternalLibraryClient`](library::ExternalLibraryClient) - Servers, libraries, paginated items
//! - [`MetadataProvider`](metadata::MetadataProvider) - Title search, lookup by id, lookup by foreign id
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to the host
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, BridgeError>`](error::BridgeError). The core
//! classifies provider failures as transient or permanent by their message, so
//! implementations should keep upstream messages (`429 Too Many Requests`,
//! `connection reset by peer`) intact inside
//! [`BridgeError::OperationFailed`].

pub mod error;
pub mod identity;
pub mod library;
pub mod metadata;
pub mod time;

pub use error::BridgeError;

pub use identity::{ExternalAccountStore, IdentityResolver, OwnerId, RequestCredentials};
pub use library::{
    ExternalLibraryClient, ItemPage, RemoteItem, RemoteLibrary, RemoteLibraryKind, RemoteServer,
    ServerConnection,
};
pub use metadata::{ExternalSource, MetadataProvider, MovieCandidate};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
