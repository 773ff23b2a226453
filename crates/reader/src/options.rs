//! Configuration for the layer reader and prefetch.

use std::fmt;
use std::sync::Arc;

use lazylayer_model::BlobReader;
use lazylayer_storage::CacheOptions;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Default maximum directory depth walked by prefetch.
pub const DEFAULT_MAX_WALK_DEPTH: usize = 10_000;

/// Default number of free buffers kept per size tier.
pub const DEFAULT_MAX_BUFFERS_PER_TIER: usize = 16;

/// Default smallest buffer tier in bytes.
pub const DEFAULT_MIN_TIER_SIZE: usize = 4096;

/// Configuration for the scratch buffer pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Free buffers retained per power-of-two tier; extras are dropped.
    pub max_buffers_per_tier: usize,
    /// Smallest tier; smaller requests are rounded up to it.
    pub min_tier_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_buffers_per_tier: DEFAULT_MAX_BUFFERS_PER_TIER,
            min_tier_size: DEFAULT_MIN_TIER_SIZE,
        }
    }
}

impl BufferPoolConfig {
    /// Set the number of retained buffers per tier.
    ///
    /// # Arguments
    /// * `max_buffers_per_tier` - Free list cap per tier
    pub fn with_max_buffers_per_tier(mut self, max_buffers_per_tier: usize) -> Self {
        self.max_buffers_per_tier = max_buffers_per_tier;
        self
    }

    /// Set the smallest tier size.
    pub fn with_min_tier_size(mut self, min_tier_size: usize) -> Self {
        self.min_tier_size = min_tier_size;
        self
    }
}

/// Options for a [`crate::VerifiableReader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderOptions {
    /// Maximum directory depth walked by prefetch before failing.
    pub max_walk_depth: usize,
    /// Concurrent chunk fetches during prefetch (None = available parallelism).
    pub prefetch_concurrency: Option<usize>,
    /// Scratch buffer pool configuration.
    pub buffer_pool: BufferPoolConfig,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            max_walk_depth: DEFAULT_MAX_WALK_DEPTH,
            prefetch_concurrency: None,
            buffer_pool: BufferPoolConfig::default(),
        }
    }
}

impl ReaderOptions {
    /// Set the maximum prefetch walk depth.
    ///
    /// # Arguments
    /// * `max_walk_depth` - Deepest directory level allowed
    pub fn with_max_walk_depth(mut self, max_walk_depth: usize) -> Self {
        self.max_walk_depth = max_walk_depth;
        self
    }

    /// Set the prefetch concurrency.
    ///
    /// # Arguments
    /// * `concurrency` - Number of chunks fetched at once (clamped to at least 1)
    pub fn with_prefetch_concurrency(mut self, concurrency: usize) -> Self {
        self.prefetch_concurrency = Some(concurrency.max(1));
        self
    }

    /// Set the buffer pool configuration.
    pub fn with_buffer_pool(mut self, buffer_pool: BufferPoolConfig) -> Self {
        self.buffer_pool = buffer_pool;
        self
    }

    /// Resolve the effective prefetch concurrency. Never less than 1.
    pub fn effective_prefetch_concurrency(&self) -> usize {
        let configured: usize = self.prefetch_concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        configured.max(1)
    }
}

/// Predicate over a file's byte offset within the blob.
pub type PrefetchFilter = Arc<dyn Fn(u64) -> bool + Send + Sync>;

/// Options for a single bulk prefetch.
#[derive(Clone, Default)]
pub struct PrefetchOptions {
    /// Restrict prefetch to files whose blob offset passes (None = all files).
    pub filter: Option<PrefetchFilter>,
    /// Fetch from this blob instead of the reader's own transport.
    pub blob: Option<Arc<dyn BlobReader>>,
    /// Options passed to every cache lookup and write.
    pub cache_options: CacheOptions,
    /// Token the caller can cancel to stop the prefetch.
    pub cancellation: Option<CancellationToken>,
}

impl PrefetchOptions {
    /// Create options that prefetch everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only prefetch files whose blob offset satisfies `filter`.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(u64) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Fetch from another blob holding the same layer.
    pub fn with_blob(mut self, blob: Arc<dyn BlobReader>) -> Self {
        self.blob = Some(blob);
        self
    }

    /// Set the cache options used for prefetched chunks.
    pub fn with_cache_options(mut self, cache_options: CacheOptions) -> Self {
        self.cache_options = cache_options;
        self
    }

    /// Attach a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Check whether the file at `blob_offset` should be prefetched.
    pub(crate) fn accepts(&self, blob_offset: u64) -> bool {
        self.filter.as_ref().map_or(true, |f| f(blob_offset))
    }
}

impl fmt::Debug for PrefetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefetchOptions")
            .field("filter", &self.filter.is_some())
            .field("blob", &self.blob.is_some())
            .field("cache_options", &self.cache_options)
            .field("cancellation", &self.cancellation.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ReaderOptions::default();
        assert_eq!(options.max_walk_depth, 10_000);
        assert!(options.prefetch_concurrency.is_none());
        assert!(options.effective_prefetch_concurrency() >= 1);
        assert_eq!(options.buffer_pool.max_buffers_per_tier, 16);
    }

    #[test]
    fn test_builder() {
        let options = ReaderOptions::default()
            .with_max_walk_depth(3)
            .with_prefetch_concurrency(0);
        assert_eq!(options.max_walk_depth, 3);
        assert_eq!(options.effective_prefetch_concurrency(), 1);
    }

    #[test]
    fn test_partial_config_from_json() {
        let options: ReaderOptions =
            serde_json::from_str(r#"{"max_walk_depth": 64, "buffer_pool": {"min_tier_size": 512}}"#)
                .unwrap();
        assert_eq!(options.max_walk_depth, 64);
        assert_eq!(options.buffer_pool.min_tier_size, 512);
        assert_eq!(options.buffer_pool.max_buffers_per_tier, 16);
    }

    #[test]
    fn test_zero_concurrency_from_config_is_clamped() {
        let options: ReaderOptions =
            serde_json::from_str(r#"{"prefetch_concurrency": 0}"#).unwrap();
        assert_eq!(options.prefetch_concurrency, Some(0));
        assert_eq!(options.effective_prefetch_concurrency(), 1);
    }

    #[test]
    fn test_filter() {
        let options = PrefetchOptions::new().with_filter(|offset| offset < 100);
        assert!(options.accepts(10));
        assert!(!options.accepts(100));
        assert!(PrefetchOptions::new().accepts(u64::MAX));
    }
}
