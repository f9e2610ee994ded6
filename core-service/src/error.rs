use core_sync::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Core initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Configuration error: {0}")]
    Config(#[from] core_runtime::Error),

    #[error("Bridge error: {0}")]
    Bridge(#[from] bridge_traits::BridgeError),

    #[error("Sync error: {0}")]
    Sync(#[from] core_sync::SyncError),

    #[error("Library error: {0}")]
    Library(#[from] core_library::LibraryError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] core_metadata::MetadataError),
}

impl CoreError {
    /// Classification a transport layer can map to a response status.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Sync(e) => e.kind(),
            CoreError::Bridge(bridge_traits::BridgeError::MissingCredentials(_)) => {
                ErrorKind::Validation
            }
            CoreError::Bridge(bridge_traits::BridgeError::NotFound(_)) => ErrorKind::NotFound,
            CoreError::Library(core_library::LibraryError::NotFound { .. }) => ErrorKind::NotFound,
            CoreError::Library(core_library::LibraryError::InvalidInput { .. }) => {
                ErrorKind::Validation
            }
            CoreError::Metadata(e) if e.is_transient() => ErrorKind::Transient,
            CoreError::Bridge(_) | CoreError::Metadata(_) => ErrorKind::Permanent,
            CoreError::InitializationFailed(_) | CoreError::Config(_) | CoreError::Library(_) => {
                ErrorKind::Internal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
