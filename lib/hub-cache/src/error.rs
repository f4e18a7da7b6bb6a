use hub_core::HubError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found in storage: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    KeyExists(String),

    #[error("Stale update of {key}: stored resourceVersion {stored}, incoming {incoming}")]
    Conflict {
        key: String,
        stored: String,
        incoming: String,
    },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Unsupported content: {0}")]
    Unsupported(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<HubError> for StorageError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::SerializationError(e) => StorageError::SerializationError(e),
            HubError::Io(e) => StorageError::Io(e),
            other => StorageError::InvalidKey(other.to_string()),
        }
    }
}
