//! Error types for tilequery.

use crate::types::TileId;
use thiserror::Error;

/// Convenience result type used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors reported by the store and the query engine.
///
/// Storage failures, predicate failures, and layout-contract violations are
/// kept as distinct variants so callers can tell an I/O problem from a
/// corrupt tile image when diagnosing a failed query.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure while opening or mapping a store file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not a tile store, or its version is unsupported.
    #[error("unrecognized store format: {0}")]
    Format(String),

    /// A tile referenced by the index is missing from the store.
    #[error("tile not found: {0:?}")]
    TileNotFound(TileId),

    /// A tile image violates the binary layout contract (truncated node,
    /// missing terminator, out-of-range pointer).
    #[error("corrupt tile data: {0}")]
    Corrupt(String),

    /// A predicate could not be evaluated against a feature record.
    #[error("predicate evaluation failed: {0}")]
    Predicate(String),

    /// Invalid caller-supplied input (bad zoom level, malformed bbox, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The worker pool could not be constructed.
    #[error("worker pool error: {0}")]
    Pool(String),

    /// Catch-all for internal invariant breaks that are not layout related.
    #[error("{0}")]
    Other(String),
}

impl From<rayon::ThreadPoolBuildError> for StoreError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        StoreError::Pool(err.to_string())
    }
}
