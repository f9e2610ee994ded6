//! # Core Library
//!
//! Durable state of the sync engine in SQLite.
//!
//! ## Overview
//!
//! - [`db`] - pool creation, embedded migrations, health check
//! - [`models`] - rows and upsert payloads for servers, libraries, items,
//!   ID mappings, access grants and local movie records
//! - [`repositories`] - `#[async_trait]` repository traits with SQLite
//!   implementations
//!
//! The job table lives in the same database; its repository is owned by
//! `core-sync`.

pub mod db;
pub mod error;
pub mod models;
pub mod repositories;

pub use error::{LibraryError, Result};
