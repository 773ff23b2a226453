//! Error types for chunk cache operations.

use thiserror::Error;

/// Errors from chunk cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The cache has been closed.
    #[error("Cache is closed")]
    Closed,

    /// A writer was committed with a different byte count than declared.
    #[error("Short write: declared {expected} bytes, wrote {actual}")]
    ShortWrite {
        /// Declared entry size in bytes.
        expected: u64,
        /// Bytes actually written.
        actual: u64,
    },
}
