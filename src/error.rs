// Crate-wide error types.
//
// `Error` is the boundary error taxonomy a caller of the public API sees.
// `StorageError` is the narrower error a `Storage` implementation reports;
// it collapses into `Error::StorageUnavailable` for anything retriable.

use thiserror::Error;

use crate::path::Path;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors a `Storage`/`Transport` implementation may surface.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage corruption: {0}")]
    Corrupt(String),
}

/// User-visible / boundary errors, per the error taxonomy.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("entry not found: {0}")]
    EntryNotFound(Path),

    #[error("entry already exists: {0}")]
    DuplicateEntry(Path),

    #[error("session terminated")]
    SessionTerminated,

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Unavailable(msg) => Error::StorageUnavailable(msg),
            StorageError::Corrupt(msg) => Error::Internal(format!("storage corruption: {msg}")),
        }
    }
}
