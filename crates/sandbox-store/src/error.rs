use sandbox_types::{SandboxError, StorageError};
use thiserror::Error;

/// The audit store's own error type: everything funnels into either
/// `StorageRead` or `StorageWrite` per spec §4.2 — "all failures are
/// `StorageRead` or `StorageWrite` with an opaque underlying-error
/// string; never partial rows."
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage read error: {0}")]
    Read(String),
    #[error("storage write error: {0}")]
    Write(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Write(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Write(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Write(err.to_string())
    }
}

impl From<StoreError> for SandboxError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Read(msg) => SandboxError::Storage(StorageError::Read(msg)),
            StoreError::Write(msg) => SandboxError::Storage(StorageError::Write(msg)),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
