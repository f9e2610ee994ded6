//! # Metadata Resolution Module
//!
//! Everything that talks to the metadata provider.
//!
//! ## Overview
//!
//! This module handles:
//! - Throttling every provider call through one shared token bucket
//!   ([`rate_limiter`])
//! - Parsing the GUID schemes emitted by media servers ([`guid`])
//! - Resolving items to provider ids with a fallback chain and a two-level
//!   cache ([`matcher`])

pub mod error;
pub mod guid;
pub mod matcher;
pub mod rate_limiter;

pub use error::{MetadataError, Result};
pub use guid::ParsedGuid;
pub use matcher::{IdMatcher, MatchOutcome, MatchQuery, MatchStrategy};
pub use rate_limiter::{Priority, RateLimiter, RateLimiterStats};
