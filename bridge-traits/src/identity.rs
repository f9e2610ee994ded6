//! Identity and Account Linking
//!
//! The engine does not authenticate anyone. The host resolves request-scoped
//! credentials to a numeric owner id, and separately knows which external
//! library account (if any) that owner has linked.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Opaque numeric identity of the user owning a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub i64);

impl OwnerId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for OwnerId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Request-scoped credentials as handed over by the host (e.g. a bearer token
/// taken from an HTTP header).
#[derive(Clone, PartialEq, Eq)]
pub struct RequestCredentials {
    pub token: String,
}

impl RequestCredentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for RequestCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCredentials")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Resolves request credentials into an owner id.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// # Errors
    ///
    /// Returns [`BridgeError::MissingCredentials`](crate::BridgeError::MissingCredentials)
    /// when the credentials do not identify a user.
    async fn resolve_owner(&self, credentials: &RequestCredentials) -> Result<OwnerId>;
}

/// Looks up the external-library account linked to an owner.
#[async_trait]
pub trait ExternalAccountStore: Send + Sync {
    /// Returns the owner's external-library access token, or `None` when the
    /// owner never connected an account.
    async fn access_token(&self, owner: OwnerId) -> Result<Option<String>>;
}
