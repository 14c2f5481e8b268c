use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A concurrent writer updated the document since our revision was read.
    #[error("revision conflict on document {0}")]
    Conflict(String),

    /// The backing storage could not be reached or failed transiently.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Keys with a leading underscore are reserved for internal use.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}
