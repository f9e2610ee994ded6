//! # Core Runtime Module
//!
//! Ambient infrastructure shared by every engine crate:
//! - Logging and tracing bootstrap
//! - Engine configuration with validation
//! - Event bus for job, library and maintenance notifications
//!
//! ## Overview
//!
//! Nothing here knows about jobs or libraries beyond the event payloads. The
//! component crates take their settings from [`config::CoreConfig`] and publish
//! through a shared [`events::EventBus`].

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
