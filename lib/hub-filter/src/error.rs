use thiserror::Error;

pub type Result<T> = std::result::Result<T, FilterError>;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Filter already registered: {0}")]
    DuplicateFilter(String),

    #[error("Unknown filter: {0}")]
    UnknownFilter(String),

    #[error("Invalid filter settings: {0}")]
    InvalidSettings(String),

    #[error("Upstream stream error: {0}")]
    Upstream(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
