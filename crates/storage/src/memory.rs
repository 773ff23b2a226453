//! In-memory chunk cache with LRU eviction.

use std::io;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::key::ChunkKey;
use crate::traits::{BlobCache, BytesReader, CacheOptions, CacheReader, CacheStats, CacheWriter};

/// Default maximum number of cached chunks.
pub const DEFAULT_MAX_MEMORY_ENTRIES: usize = 4096;

/// Options for the in-memory cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryCacheOptions {
    /// Maximum number of chunks held before the least recently used is evicted.
    pub max_entries: usize,
}

impl Default for MemoryCacheOptions {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_MEMORY_ENTRIES,
        }
    }
}

impl MemoryCacheOptions {
    /// Create options with a custom entry bound.
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self { max_entries }
    }
}

/// Shared state behind the cache and its outstanding writers.
struct MemoryCacheInner {
    entries: Mutex<LruCache<ChunkKey, Arc<Vec<u8>>>>,
    closed: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCacheInner {
    /// Insert a committed entry, counting displaced neighbours as evictions.
    fn insert(&self, key: ChunkKey, data: Arc<Vec<u8>>) {
        let mut entries = self.entries.lock();
        if let Some((displaced, _)) = entries.push(key.clone(), data) {
            if displaced != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// In-memory [`BlobCache`].
///
/// Entries are kept in an LRU bounded by entry count; committing an existing
/// key replaces it.
#[derive(Clone)]
pub struct MemoryBlobCache {
    inner: Arc<MemoryCacheInner>,
}

impl MemoryBlobCache {
    /// Create a new memory cache.
    ///
    /// # Arguments
    /// * `options` - Cache configuration options
    pub fn new(options: MemoryCacheOptions) -> Self {
        let capacity: NonZeroUsize = NonZeroUsize::new(options.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(MemoryCacheInner {
                entries: Mutex::new(LruCache::new(capacity)),
                closed: AtomicBool::new(false),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                commits: AtomicU64::new(0),
                aborts: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    /// Create a memory cache with default options.
    pub fn with_defaults() -> Self {
        Self::new(MemoryCacheOptions::default())
    }

    /// Check if a chunk is cached without touching its recency.
    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.inner.entries.lock().contains(key)
    }

    /// Number of cached chunks.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Check if the cache holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let inner: &MemoryCacheInner = &self.inner;
        CacheStats {
            hits: inner.hits.load(Ordering::Relaxed),
            misses: inner.misses.load(Ordering::Relaxed),
            commits: inner.commits.load(Ordering::Relaxed),
            aborts: inner.aborts.load(Ordering::Relaxed),
            evictions: inner.evictions.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
        }
    }

    fn check_open(&self) -> Result<(), CacheError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }
}

impl Default for MemoryBlobCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl BlobCache for MemoryBlobCache {
    fn get(
        &self,
        key: &ChunkKey,
        _opts: CacheOptions,
    ) -> Result<Option<Box<dyn CacheReader>>, CacheError> {
        self.check_open()?;

        let found: Option<Arc<Vec<u8>>> = self.inner.entries.lock().get(key).cloned();
        match found {
            Some(data) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(Box::new(BytesReader::new(data))))
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    fn exists(&self, key: &ChunkKey, _opts: CacheOptions) -> Result<bool, CacheError> {
        self.check_open()?;
        Ok(self.contains(key))
    }

    fn add(
        &self,
        key: &ChunkKey,
        declared_len: u64,
        _opts: CacheOptions,
    ) -> Result<Box<dyn CacheWriter>, CacheError> {
        self.check_open()?;

        Ok(Box::new(MemoryCacheWriter {
            inner: self.inner.clone(),
            key: key.clone(),
            declared_len,
            buf: Vec::with_capacity(declared_len as usize),
            finished: false,
        }))
    }

    fn close(&self) -> Result<(), CacheError> {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.entries.lock().clear();
        }
        Ok(())
    }
}

/// Writer that buffers a chunk until commit.
struct MemoryCacheWriter {
    inner: Arc<MemoryCacheInner>,
    key: ChunkKey,
    declared_len: u64,
    buf: Vec<u8>,
    finished: bool,
}

impl io::Write for MemoryCacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CacheWriter for MemoryCacheWriter {
    fn commit(mut self: Box<Self>) -> Result<(), CacheError> {
        self.finished = true;
        let written: u64 = self.buf.len() as u64;

        if written != self.declared_len {
            self.inner.aborts.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::ShortWrite {
                expected: self.declared_len,
                actual: written,
            });
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }

        let data: Vec<u8> = std::mem::take(&mut self.buf);
        self.inner.insert(self.key.clone(), Arc::new(data));
        self.inner.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn abort(mut self: Box<Self>) {
        self.finished = true;
        self.inner.aborts.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for MemoryCacheWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.aborts.fetch_add(1, Ordering::Relaxed);
        }
    }
}
