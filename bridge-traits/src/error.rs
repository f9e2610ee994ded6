use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Returns true when the error means the requested record does not exist
    /// on the remote side (as opposed to the call failing).
    pub fn is_not_found(&self) -> bool {
        matches!(self, BridgeError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
