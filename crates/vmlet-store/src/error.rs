//! Error types for the durable store.

use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the durable object store. The first three are
/// stable identifiers callers are expected to match on.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An object with this ID already exists.
    #[error("object {0} already exists")]
    AlreadyExists(String),

    /// No object with this ID.
    #[error("object {0} not found")]
    NotFound(String),

    /// The update was based on a stale resource version.
    #[error("object {0} has a newer resource version")]
    ResourceVersionNotLatest(String),

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The on-disk record did not decode, or the record did not encode.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The per-ID lock table was poisoned by a panicking thread.
    #[error("store lock poisoned")]
    LockPoisoned,
}
