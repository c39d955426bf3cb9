//! Crate-wide error type and result alias.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, BasaltError>;

/// Errors surfaced by the index engine and its support modules.
///
/// Space exhaustion is deliberately not represented here: page allocation
/// returns `None` (the null-page sentinel) and callers above the split
/// machinery are expected to have reserved free pages beforehand.
#[derive(Debug, Error)]
pub enum BasaltError {
    /// An on-page structure failed a consistency check.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A caller violated an API precondition.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A key insert would violate a unique index.
    #[error("duplicate key in unique index")]
    DuplicateKey,
    /// The requested record does not exist.
    #[error("not found")]
    NotFound,
}
