//! Verifying layer reader.
//!
//! A [`VerifiableReader`] hands out a [`Reader`] only once the layer's table
//! of contents has been confirmed against a trusted digest (or the caller
//! explicitly opts out with [`VerifiableReader::skip_verify`]).
//!
//! # State machine
//!
//! ```text
//!            verify_toc(expected)
//! Unverified ─────────────────────► Verified
//!     │  (enforcement set first, one-way)
//!     │
//!     └── speculative reads: chunk failures recorded, data served uncached
//! ```

use std::sync::Arc;

use lazylayer_model::{Digest, MetadataReader};
use lazylayer_storage::BlobCache;

use crate::error::{ReaderError, VerifyError};
use crate::options::{PrefetchOptions, ReaderOptions};
use crate::prefetch::prefetch;
use crate::reader::{LayerReader, Reader};
use crate::stats::ReaderStats;

/// Entry point for reading a lazily fetched layer.
pub struct VerifiableReader {
    inner: Arc<LayerReader>,
    layer_digest: Digest,
}

impl VerifiableReader {
    /// Create a reader over a layer.
    ///
    /// # Arguments
    /// * `metadata` - Metadata reader for the layer's table of contents
    /// * `cache` - Chunk cache shared by reads and prefetch
    /// * `layer_digest` - Digest identifying the layer blob
    /// * `options` - Reader configuration
    pub fn new(
        metadata: Arc<dyn MetadataReader>,
        cache: Arc<dyn BlobCache>,
        layer_digest: Digest,
        options: ReaderOptions,
    ) -> Self {
        tracing::debug!(layer = %layer_digest, "Opening layer reader");
        Self {
            inner: LayerReader::new(metadata, cache, options),
            layer_digest,
        }
    }

    /// Get a [`Reader`] without confirming the table of contents.
    ///
    /// Only for callers with an independent trust path. Chunk verification
    /// failures are still recorded but do not fail reads.
    pub fn skip_verify(&self) -> Arc<dyn Reader> {
        self.inner.clone()
    }

    /// Confirm the table of contents and get a [`Reader`].
    ///
    /// From the moment this is called, chunk verification failures fail
    /// reads immediately, including reads already in flight.
    ///
    /// # Arguments
    /// * `expected` - Trusted digest of the table of contents
    ///
    /// # Errors
    /// * [`ReaderError::AlreadyClosed`] - The reader was closed
    /// * [`ReaderError::ContentCorruption`] - An earlier speculative read saw a corrupt chunk
    /// * [`ReaderError::TocMismatch`] - The table of contents does not match `expected`
    pub fn verify_toc(&self, expected: &Digest) -> Result<Arc<dyn Reader>, ReaderError> {
        self.inner.ensure_open()?;

        if let Some(err) = self.inner.state.enforce() {
            tracing::warn!(layer = %self.layer_digest, "Rejecting layer with corrupt chunk: {}", err);
            return Err(ReaderError::ContentCorruption(err));
        }

        let actual: Digest = self.inner.metadata.toc_digest();
        if &actual != expected {
            tracing::warn!(
                layer = %self.layer_digest,
                expected = %expected,
                actual = %actual,
                "Table of contents mismatch"
            );
            return Err(ReaderError::TocMismatch {
                expected: expected.clone(),
                actual,
            });
        }

        self.inner.state.mark_verified();
        tracing::debug!(layer = %self.layer_digest, toc = %actual, "Layer verified");
        Ok(self.inner.clone())
    }

    /// Whether [`VerifiableReader::verify_toc`] has succeeded.
    pub fn is_verified(&self) -> bool {
        self.inner.state.is_verified()
    }

    /// Get the metadata reader backing this layer.
    pub fn metadata(&self) -> Arc<dyn MetadataReader> {
        self.inner.metadata.clone()
    }

    /// Fetch and cache every regular file's chunks.
    ///
    /// Already-cached chunks are skipped. Runs fetches on the blocking pool
    /// with bounded concurrency and stops at the first failure.
    pub async fn cache(&self, options: PrefetchOptions) -> Result<(), ReaderError> {
        prefetch(self.inner.clone(), options).await
    }

    /// Close the cache and metadata reader. Idempotent.
    pub fn close(&self) -> Result<(), ReaderError> {
        self.inner.close()
    }

    /// The most recent verification failure seen by a speculative read.
    pub fn last_verify_error(&self) -> Option<VerifyError> {
        self.inner.state.last_verify_error()
    }

    /// Get read path statistics.
    pub fn stats(&self) -> ReaderStats {
        self.inner.stats()
    }

    /// Digest identifying the layer blob.
    pub fn layer_digest(&self) -> &Digest {
        &self.layer_digest
    }
}
