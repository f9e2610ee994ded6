//! # Repository Pattern Implementation
//!
//! Repository traits and SQLite implementations for the mirrored catalog.
//!
//! ## Architecture
//!
//! - Traits define the interface so components can be tested against fakes
//! - SQLite implementations use sqlx with plain runtime queries
//! - Every write keyed by an external identifier is an upsert
//! - Timestamps are passed in by the caller (unix seconds)
//!
//! ## Available Repositories
//!
//! - `ServerRepository` - Media servers keyed by machine id
//! - `LibraryRepository` - Library sections keyed by (server, key), cached item counts
//! - `ItemRepository` - Catalog items keyed by (library, native key), match state
//! - `MappingRepository` - GUID to metadata id cache
//! - `AccessGrantRepository` - Owner to library grants
//! - `MovieRepository` - Local metadata records
//! - `UsageRepository` - Rate limiter usage totals

pub mod access;
pub mod item;
pub mod library;
pub mod mapping;
pub mod movie;
pub mod server;
pub mod usage;

pub use access::{AccessGrantRepository, SqliteAccessGrantRepository};
pub use item::{ItemRepository, SqliteItemRepository};
pub use library::{LibraryRepository, SqliteLibraryRepository};
pub use mapping::{MappingRepository, SqliteMappingRepository};
pub use movie::{MovieRepository, SqliteMovieRepository};
pub use server::{ServerRepository, SqliteServerRepository};
pub use usage::{SqliteUsageRepository, UsageRepository};
