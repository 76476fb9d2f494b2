//! Error types for data store backends.

use thiserror::Error;

/// Errors a data store backend can report.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend cannot be reached
    #[error("data store unavailable: {0}")]
    Unavailable(String),

    /// Key rejected by the backend
    #[error("invalid key '{0}'")]
    InvalidKey(String),

    /// Backend I/O failure
    #[error("data store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal backend error
    #[error("internal data store error: {0}")]
    Internal(String),
}
