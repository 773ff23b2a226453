//! Error types for the layer reader.

use std::io;

use lazylayer_model::{Digest, EntryId, ModelError};
use lazylayer_storage::CacheError;
use thiserror::Error;

/// A chunk whose content does not match its declared digest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    /// Fetched bytes hash to a different value.
    #[error("Digest mismatch for file {file_id} chunk {offset}+{size}: expected {expected}, got {actual}")]
    DigestMismatch {
        file_id: EntryId,
        offset: u64,
        size: u64,
        expected: String,
        actual: String,
    },

    /// The chunk map carries a digest that cannot be parsed.
    #[error("Invalid digest {digest:?} for file {file_id} chunk at {offset}")]
    InvalidDigest {
        file_id: EntryId,
        offset: u64,
        digest: String,
    },
}

/// Errors that can occur during reader operations.
#[derive(Debug, Error)]
pub enum ReaderError {
    /// Operation attempted after close.
    #[error("Reader is already closed")]
    AlreadyClosed,

    /// The table of contents does not match the expected digest.
    #[error("Table of contents mismatch: expected {expected}, got {actual}")]
    TocMismatch { expected: Digest, actual: Digest },

    /// Chunk content failed verification.
    #[error("Content corruption: {0}")]
    ContentCorruption(#[source] VerifyError),

    /// The prefetch walk went deeper than allowed.
    #[error("Tree too deep: depth {depth} exceeds maximum {max}")]
    TreeTooDeep { depth: usize, max: usize },

    /// The transport failed to deliver a chunk.
    #[error("Failed to fetch {file} chunk {offset}+{size}: {source}")]
    ChunkFetchFailed {
        file: String,
        offset: u64,
        size: u64,
        #[source]
        source: io::Error,
    },

    /// The transport delivered fewer bytes than the chunk map declares.
    #[error("Unexpected size for {file} chunk at {offset}: expected {expected}, got {actual}")]
    UnexpectedSize {
        file: String,
        offset: u64,
        expected: u64,
        actual: u64,
    },

    /// Chunk cache error.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Metadata reader error.
    #[error("Metadata error: {0}")]
    Metadata(#[from] ModelError),

    /// Prefetch was cancelled by the caller.
    #[error("Operation was cancelled")]
    Cancelled,

    /// A background task panicked or was aborted.
    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl ReaderError {
    /// Check if this error means the layer content cannot be trusted.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            ReaderError::ContentCorruption(_) | ReaderError::TocMismatch { .. }
        )
    }
}

impl From<ReaderError> for io::Error {
    fn from(e: ReaderError) -> Self {
        let kind: io::ErrorKind = match &e {
            ReaderError::AlreadyClosed => io::ErrorKind::NotConnected,
            ReaderError::TocMismatch { .. } | ReaderError::ContentCorruption(_) => {
                io::ErrorKind::InvalidData
            }
            ReaderError::ChunkFetchFailed { source, .. } => source.kind(),
            ReaderError::UnexpectedSize { .. } => io::ErrorKind::UnexpectedEof,
            ReaderError::Cancelled => io::ErrorKind::Interrupted,
            ReaderError::Metadata(ModelError::EntryNotFound(_)) => io::ErrorKind::NotFound,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kinds() {
        let corrupt = ReaderError::ContentCorruption(VerifyError::InvalidDigest {
            file_id: 3,
            offset: 0,
            digest: "bogus".to_string(),
        });
        assert_eq!(io::Error::from(corrupt).kind(), io::ErrorKind::InvalidData);

        let fetch = ReaderError::ChunkFetchFailed {
            file: "a.txt".to_string(),
            offset: 0,
            size: 4,
            source: io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
        };
        assert_eq!(io::Error::from(fetch).kind(), io::ErrorKind::ConnectionReset);

        assert_eq!(
            io::Error::from(ReaderError::AlreadyClosed).kind(),
            io::ErrorKind::NotConnected
        );
    }

    #[test]
    fn test_integrity_classification() {
        let mismatch = ReaderError::TocMismatch {
            expected: Digest::sha256(b"a"),
            actual: Digest::sha256(b"b"),
        };
        assert!(mismatch.is_integrity_failure());
        assert!(!ReaderError::Cancelled.is_integrity_failure());
    }

    #[test]
    fn test_display_includes_chunk_range() {
        let err = VerifyError::DigestMismatch {
            file_id: 7,
            offset: 4,
            size: 4,
            expected: "sha256:aa".to_string(),
            actual: "sha256:bb".to_string(),
        };
        let msg: String = err.to_string();
        assert!(msg.contains("file 7 chunk 4+4"));
    }
}
