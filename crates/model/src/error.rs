//! Error types for layer metadata operations.

use thiserror::Error;

use crate::entry::EntryId;

/// Errors that can occur while reading layer metadata.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Entry not found: {0}")]
    EntryNotFound(EntryId),

    #[error("Not a directory: {0}")]
    NotADirectory(EntryId),

    #[error("Not a regular file: {0}")]
    NotAFile(EntryId),

    #[error("Invalid digest: {0:?}")]
    InvalidDigest(String),

    #[error("Unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid layer path: {0:?}")]
    InvalidPath(String),

    #[error("Metadata reader is closed")]
    Closed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
