//! Error types for rate limiting.

use crate::storage::StorageError;

/// Errors that can occur while setting up or reconfiguring rate limiting.
///
/// Exceeding a limit is not an error: it is reported through [`crate::RateLimitResult`].
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// A route rule or limiter setting is invalid.
    #[error("Invalid rate limit configuration: {0}")]
    Config(String),

    /// Storage backend error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
