//! Crate-wide error type and result alias.

use thiserror::Error;

use crate::query::errors::QueryError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LoamError>;

/// Top-level error surfaced by the query core.
#[derive(Debug, Error)]
pub enum LoamError {
    /// Error raised while preparing, compiling, or executing a query.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// The named collection is not present in the store.
    #[error("collection '{0}' not found")]
    CollectionNotFound(String),
    /// The store rejected a read (snapshot torn down, backend failure).
    #[error("store error: {0}")]
    Store(String),
}
