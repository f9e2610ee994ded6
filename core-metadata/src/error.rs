use bridge_traits::error::BridgeError;
use core_library::LibraryError;
use thiserror::Error;

/// Message fragments that mark a provider failure as worth retrying.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "rate limit",
    "too many requests",
    "429",
    "timeout",
    "timed out",
    "connection reset",
];

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Rate limiter queue is full")]
    QueueFull,

    #[error("Rate limited request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Rate limiter is shut down")]
    Shutdown,

    #[error("Provider error: {0}")]
    Provider(#[from] BridgeError),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),
}

impl MetadataError {
    /// Whether the failure matches a known transient signature
    /// (rate-limited, timed out, connection reset).
    pub fn is_transient(&self) -> bool {
        match self {
            MetadataError::Provider(err) => is_transient_message(&err.to_string()),
            _ => false,
        }
    }
}

pub fn is_transient_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    TRANSIENT_SIGNATURES
        .iter()
        .any(|signature| message.contains(signature))
}

pub type Result<T> = std::result::Result<T, MetadataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_signatures() {
        for message in [
            "HTTP 429 Too Many Requests",
            "upstream rate limit exceeded",
            "request timed out",
            "Connection reset by peer",
        ] {
            let err = MetadataError::Provider(BridgeError::OperationFailed(message.to_string()));
            assert!(err.is_transient(), "{} should be transient", message);
        }
    }

    #[test]
    fn test_permanent_errors_are_not_transient() {
        let err = MetadataError::Provider(BridgeError::OperationFailed(
            "401 invalid api key".to_string(),
        ));
        assert!(!err.is_transient());
        assert!(!MetadataError::QueueFull.is_transient());
        assert!(!MetadataError::Cancelled.is_transient());
    }
}
