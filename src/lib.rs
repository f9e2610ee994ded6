//! Workspace umbrella crate.
//!
//! Host applications can depend on `media-sync-workspace` and reach the
//! service façade without wiring each crate individually.

pub use core_service::*;
