//! The `Reader` capability and the state shared by every handle on a layer.

use std::io::Write;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use lazylayer_model::{BoxError, ChunkEntry, ChunkedFile, EntryId, MetadataReader, PreReadHook};
use lazylayer_storage::{BlobCache, CacheError, CacheOptions, CacheReader, CacheWriter, ChunkKey};

use crate::buffer_pool::BufferPool;
use crate::error::ReaderError;
use crate::file::FileHandle;
use crate::inflight::FetchGates;
use crate::options::ReaderOptions;
use crate::stats::{ReaderStats, StatsCollector};
use crate::verify::{ChunkTrust, VerifyState};

/// Read access to a layer's files.
///
/// Obtained from [`crate::VerifiableReader::verify_toc`] or
/// [`crate::VerifiableReader::skip_verify`]; all handles share one cache and
/// one verification state.
pub trait Reader: Send + Sync {
    /// Open a regular file by entry ID.
    fn open_file(&self, id: EntryId) -> Result<FileHandle, ReaderError>;

    /// Get the metadata reader backing this layer.
    fn metadata(&self) -> Arc<dyn MetadataReader>;

    /// Close the reader, releasing the cache and metadata reader. Idempotent.
    fn close(&self) -> Result<(), ReaderError>;

    /// Time of the most recent cache-miss fetch (creation time if none yet).
    fn last_on_demand_read_time(&self) -> SystemTime;
}

/// Shared reader core.
pub(crate) struct LayerReader {
    pub metadata: Arc<dyn MetadataReader>,
    pub cache: Arc<dyn BlobCache>,
    pub state: VerifyState,
    pub stats: StatsCollector,
    pub buffers: BufferPool,
    pub gates: FetchGates,
    pub options: ReaderOptions,
    weak_self: Weak<LayerReader>,
}

impl LayerReader {
    pub fn new(
        metadata: Arc<dyn MetadataReader>,
        cache: Arc<dyn BlobCache>,
        options: ReaderOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            metadata,
            cache,
            state: VerifyState::new(),
            stats: StatsCollector::new(),
            buffers: BufferPool::new(options.buffer_pool.clone()),
            gates: FetchGates::new(),
            options,
            weak_self: weak_self.clone(),
        })
    }

    pub fn ensure_open(&self) -> Result<(), ReaderError> {
        if self.state.is_closed() {
            return Err(ReaderError::AlreadyClosed);
        }
        Ok(())
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats.collect(self.buffers.stats(), self.gates.len())
    }

    /// Copy `dest.len()` bytes at `lower` out of the cached chunk.
    ///
    /// Any cache error, or an entry that cannot supply the whole range, is a miss.
    pub fn read_cached(
        &self,
        key: &ChunkKey,
        dest: &mut [u8],
        lower: u64,
        opts: CacheOptions,
    ) -> bool {
        let reader: Box<dyn CacheReader> = match self.cache.get(key, opts) {
            Ok(Some(reader)) => reader,
            Ok(None) => return false,
            Err(e) => {
                tracing::debug!(key = %key, "Cache lookup failed, treating as miss: {}", e);
                return false;
            }
        };

        match reader.read_at(dest, lower) {
            Ok(n) if n == dest.len() => true,
            Ok(n) => {
                tracing::debug!(key = %key, got = n, want = dest.len(), "Cached chunk too short");
                false
            }
            Err(e) => {
                tracing::debug!(key = %key, "Cached chunk unreadable: {}", e);
                false
            }
        }
    }

    /// Check whether a chunk is present without copying it. Errors count as absent.
    pub fn is_cached(&self, key: &ChunkKey, opts: CacheOptions) -> bool {
        match self.cache.exists(key, opts) {
            Ok(present) => present,
            Err(e) => {
                tracing::debug!(key = %key, "Cache presence check failed: {}", e);
                false
            }
        }
    }

    /// Read a whole chunk from the transport into `dest`.
    ///
    /// # Arguments
    /// * `file` - Opened file to fetch from
    /// * `label` - File name used in errors
    /// * `chunk` - Chunk to fetch; `dest` must be exactly `chunk.size` long
    pub fn fetch_chunk(
        &self,
        file: &dyn ChunkedFile,
        label: &str,
        chunk: &ChunkEntry,
        dest: &mut [u8],
    ) -> Result<(), ReaderError> {
        let mut filled: usize = 0;
        while filled < dest.len() {
            let n: usize = file
                .read_at(&mut dest[filled..], chunk.offset + filled as u64)
                .map_err(|source| ReaderError::ChunkFetchFailed {
                    file: label.to_string(),
                    offset: chunk.offset,
                    size: chunk.size,
                    source,
                })?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled as u64 != chunk.size {
            return Err(ReaderError::UnexpectedSize {
                file: label.to_string(),
                offset: chunk.offset,
                expected: chunk.size,
                actual: filled as u64,
            });
        }
        Ok(())
    }

    /// Write a verified chunk through the two-phase cache protocol.
    pub fn store_chunk(
        &self,
        key: &ChunkKey,
        data: &[u8],
        opts: CacheOptions,
    ) -> Result<(), CacheError> {
        let mut writer: Box<dyn CacheWriter> = self.cache.add(key, data.len() as u64, opts)?;
        if let Err(e) = writer.write_all(data) {
            writer.abort();
            return Err(e.into());
        }
        writer.commit()
    }

    /// Verify a freshly fetched chunk and cache it if trusted.
    ///
    /// Cache write failures are logged and counted, never returned.
    pub fn admit_chunk(
        &self,
        file_id: EntryId,
        chunk: &ChunkEntry,
        key: &ChunkKey,
        data: &[u8],
        opts: CacheOptions,
    ) -> Result<ChunkTrust, ReaderError> {
        let trust: ChunkTrust = self.check_chunk(file_id, chunk, data)?;
        if trust == ChunkTrust::Verified {
            if let Err(e) = self.store_chunk(key, data, opts) {
                StatsCollector::incr(&self.stats.cache_write_failures);
                tracing::debug!(file_id, offset = chunk.offset, key = %key, "Failed to cache chunk: {}", e);
            }
        }
        Ok(trust)
    }

    /// Verify a chunk under the current trust policy, counting failures.
    pub fn check_chunk(
        &self,
        file_id: EntryId,
        chunk: &ChunkEntry,
        data: &[u8],
    ) -> Result<ChunkTrust, ReaderError> {
        let result: Result<ChunkTrust, ReaderError> = self.state.check(file_id, chunk, data);
        if !matches!(result, Ok(ChunkTrust::Verified)) {
            StatsCollector::incr(&self.stats.verify_failures);
        }
        result
    }

    /// Hook that caches neighbour chunks the transport decoded incidentally.
    pub fn pre_read_hook(&self) -> PreReadHook {
        let weak: Weak<LayerReader> = self.weak_self.clone();
        Arc::new(move |file_id: EntryId, chunk: &ChunkEntry, data: &[u8]| -> Result<(), BoxError> {
            match weak.upgrade() {
                Some(reader) => reader.on_pre_read(file_id, chunk, data).map_err(BoxError::from),
                None => Ok(()),
            }
        })
    }

    fn on_pre_read(&self, file_id: EntryId, chunk: &ChunkEntry, data: &[u8]) -> Result<(), ReaderError> {
        if self.state.is_closed() || data.len() as u64 != chunk.size {
            return Ok(());
        }
        let key = ChunkKey::new(file_id, chunk.offset, chunk.size);
        if self.is_cached(&key, CacheOptions::direct()) {
            return Ok(());
        }

        if self.check_chunk(file_id, chunk, data)? == ChunkTrust::Verified {
            self.store_chunk(&key, data, CacheOptions::direct())?;
            StatsCollector::incr(&self.stats.pre_read_cached);
            tracing::debug!(file_id, offset = chunk.offset, size = chunk.size, "Cached pre-read chunk");
        }
        Ok(())
    }

    fn shared(&self) -> Result<Arc<LayerReader>, ReaderError> {
        self.weak_self.upgrade().ok_or(ReaderError::AlreadyClosed)
    }
}

impl Reader for LayerReader {
    fn open_file(&self, id: EntryId) -> Result<FileHandle, ReaderError> {
        self.ensure_open()?;
        let size: u64 = self.metadata.get_attr(id)?.size;
        let file: Arc<dyn ChunkedFile> = self.metadata.open_file(id, Some(self.pre_read_hook()))?;
        Ok(FileHandle::new(self.shared()?, id, file, size))
    }

    fn metadata(&self) -> Arc<dyn MetadataReader> {
        self.metadata.clone()
    }

    fn close(&self) -> Result<(), ReaderError> {
        if !self.state.mark_closed() {
            return Ok(());
        }

        // Both are attempted; the first error wins.
        let cache_result: Result<(), CacheError> = self.cache.close();
        let metadata_result = self.metadata.close();
        tracing::debug!("Layer reader closed");

        cache_result?;
        metadata_result?;
        Ok(())
    }

    fn last_on_demand_read_time(&self) -> SystemTime {
        self.stats.last_on_demand_read()
    }
}
