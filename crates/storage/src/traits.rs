//! Chunk cache traits.

use std::io;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::key::ChunkKey;

/// Per-call cache options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Bypass the in-memory tier of a tiered backend.
    ///
    /// Used for bulk prefetch and pre-read data that should not displace the
    /// hot working set.
    pub direct: bool,
}

impl CacheOptions {
    /// Options that bypass the in-memory tier.
    pub fn direct() -> Self {
        Self { direct: true }
    }
}

/// Content-addressed chunk cache.
///
/// Implementations must be safe for concurrent readers and writers. The cache
/// is advisory: entries may disappear at any time, and callers must always be
/// able to re-derive the data. Committing the same key twice must not produce
/// torn entries.
pub trait BlobCache: Send + Sync {
    /// Look up a cached chunk.
    ///
    /// # Arguments
    /// * `key` - Chunk key
    /// * `opts` - Cache options
    ///
    /// # Returns
    /// A read handle over the whole entry, or None on a miss. The handle is
    /// released on drop.
    fn get(&self, key: &ChunkKey, opts: CacheOptions)
        -> Result<Option<Box<dyn CacheReader>>, CacheError>;

    /// Check whether a chunk is cached without reading it.
    ///
    /// The default goes through [`BlobCache::get`]; backends that can answer
    /// more cheaply should override it. Does not count as a hit or a miss.
    ///
    /// # Arguments
    /// * `key` - Chunk key
    /// * `opts` - Cache options
    fn exists(&self, key: &ChunkKey, opts: CacheOptions) -> Result<bool, CacheError> {
        Ok(self.get(key, opts)?.is_some())
    }

    /// Start writing a chunk.
    ///
    /// Nothing becomes visible until [`CacheWriter::commit`] succeeds. Dropping
    /// the writer without committing discards it.
    ///
    /// # Arguments
    /// * `key` - Chunk key
    /// * `declared_len` - Exact number of bytes the caller will write
    /// * `opts` - Cache options
    fn add(
        &self,
        key: &ChunkKey,
        declared_len: u64,
        opts: CacheOptions,
    ) -> Result<Box<dyn CacheWriter>, CacheError>;

    /// Release all cache resources. Idempotent.
    fn close(&self) -> Result<(), CacheError>;
}

/// Read handle over one cached chunk.
pub trait CacheReader: Send {
    /// Read up to `buf.len()` bytes starting at `offset` within the entry.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Size of the entry in bytes.
    fn len(&self) -> u64;

    /// Check if the entry is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write sink for one chunk.
pub trait CacheWriter: io::Write + Send {
    /// Publish the written bytes under the writer's key.
    ///
    /// Fails with [`CacheError::ShortWrite`] (publishing nothing) when the
    /// byte count differs from the declared length.
    fn commit(self: Box<Self>) -> Result<(), CacheError>;

    /// Discard the written bytes.
    fn abort(self: Box<Self>);
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of lookups that found an entry.
    pub hits: u64,
    /// Number of lookups that found nothing.
    pub misses: u64,
    /// Number of successful commits.
    pub commits: u64,
    /// Number of writers discarded without commit.
    pub aborts: u64,
    /// Number of entries evicted from memory tiers.
    pub evictions: u64,
    /// Number of entries currently held.
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total: u64 = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Read handle over bytes held in memory.
#[derive(Debug, Clone)]
pub struct BytesReader {
    data: std::sync::Arc<Vec<u8>>,
}

impl BytesReader {
    /// Wrap shared bytes.
    pub fn new(data: std::sync::Arc<Vec<u8>>) -> Self {
        Self { data }
    }
}

impl CacheReader for BytesReader {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let len: usize = self.data.len();
        let start: usize = (offset as usize).min(len);
        let end: usize = (start + buf.len()).min(len);
        buf[..end - start].copy_from_slice(&self.data[start..end]);
        Ok(end - start)
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}
