use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("registry error: {0}")]
    Registry(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("{0} not found")]
    NotFound(&'static str),
}

impl EngineError {
    /// True for lifecycle-command rejections that callers treat as a
    /// reported no-op rather than a fault.
    pub fn is_rejection(&self) -> bool {
        matches!(self, EngineError::Rejected(_))
    }
}
