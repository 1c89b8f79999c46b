//! Error types for cache operations.

use hibernia_codec::CodecError;
use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors that can occur during cache operations.
///
/// A rejected put-from-load is not an error; strategies report it as
/// `Ok(false)`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// An internal consistency rule was broken, such as comparing a data
    /// version that forbids comparison.
    #[error("cache consistency violation: {0}")]
    Consistency(String),

    /// A cached value could not be encoded or decoded.
    #[error("cache codec error: {0}")]
    Codec(#[from] CodecError),

    /// A key could not be locked in time.
    #[error("timed out locking cache key {key}")]
    LockTimeout {
        /// Display form of the key.
        key: String,
    },
}
