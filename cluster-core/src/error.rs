//! Error kinds surfaced by the public API.
//!
//! Mirrors the error taxonomy the core actually needs: malformed
//! configuration, mutation-after-join, queries before join, registry I/O
//! failures, allocation failures, and static-backend bounds violations.

use thiserror::Error;

/// Errors returned by [`crate::lifecycle::Cluster`] operations.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// A malformed or out-of-range argument.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Configuration mutated after `join`/`join_passive`.
    #[error("cluster is already joined; leave before changing configuration")]
    Busy,

    /// Runtime state queried before a successful join.
    #[error("cluster has not joined")]
    NotJoined,

    /// Registry transport failure. Loops retry these locally; `join`
    /// surfaces them as fatal.
    #[error("registry adapter error: {0}")]
    Adapter(String),

    /// Allocation failure, always fatal at the call site.
    #[error("resource allocation failed: {0}")]
    Resource(String),

    /// Static backend bounds violated at `join`.
    #[error("invalid static assignment: {0}")]
    FatalConfig(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

impl From<reqwest::Error> for ClusterError {
    fn from(err: reqwest::Error) -> Self {
        ClusterError::Adapter(err.to_string())
    }
}

impl From<sqlx::Error> for ClusterError {
    fn from(err: sqlx::Error) -> Self {
        ClusterError::Adapter(err.to_string())
    }
}
