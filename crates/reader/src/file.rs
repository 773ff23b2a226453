//! Per-file read path.
//!
//! ```text
//! read_at(buf, offset)
//!   for each covering chunk, ascending:
//!     cache hit ──────────────────────────────► copy sub-range
//!     miss ─► gate ─► re-check cache ─► fetch whole chunk
//!                                        ├─ aligned: straight into buf
//!                                        └─ partial: pooled scratch, copy out
//!                                      ─► verify ─► cache (best effort)
//! ```

use std::fmt;
use std::sync::Arc;

use lazylayer_model::{ChunkEntry, ChunkedFile, EntryId};
use lazylayer_storage::{CacheOptions, ChunkKey};

use crate::error::ReaderError;
use crate::reader::LayerReader;
use crate::stats::StatsCollector;

/// An open regular file.
///
/// Cheap to share across threads; concurrent `read_at` calls are allowed.
pub struct FileHandle {
    reader: Arc<LayerReader>,
    id: EntryId,
    file: Arc<dyn ChunkedFile>,
    size: u64,
    label: String,
}

impl FileHandle {
    pub(crate) fn new(
        reader: Arc<LayerReader>,
        id: EntryId,
        file: Arc<dyn ChunkedFile>,
        size: u64,
    ) -> Self {
        Self {
            reader,
            id,
            file,
            size,
            label: format!("entry {}", id),
        }
    }

    /// Entry ID of the file.
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read up to `buf.len()` bytes at `offset`.
    ///
    /// Returns fewer bytes only when the end of the file is reached.
    ///
    /// # Arguments
    /// * `buf` - Destination buffer
    /// * `offset` - Byte offset within the file
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, ReaderError> {
        self.reader.ensure_open()?;
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }

        let end: u64 = offset.saturating_add(buf.len() as u64);
        let mut filled: usize = 0;
        while filled < buf.len() {
            let pos: u64 = offset + filled as u64;
            let Some(chunk) = self.file.chunk_entry_for_offset(pos) else {
                break;
            };
            if chunk.end() <= pos {
                break;
            }

            let lower_discard: u64 = pos - chunk.offset;
            let upper_discard: u64 = chunk.end().saturating_sub(end);
            let expected: usize = (chunk.size - lower_discard - upper_discard) as usize;

            self.read_chunk(&chunk, &mut buf[filled..filled + expected], lower_discard)?;
            filled += expected;
        }
        Ok(filled)
    }

    /// Fill `dest` with the bytes of `chunk` starting `lower` bytes in.
    fn read_chunk(&self, chunk: &ChunkEntry, dest: &mut [u8], lower: u64) -> Result<(), ReaderError> {
        let reader: &LayerReader = &self.reader;
        let key = ChunkKey::new(self.id, chunk.offset, chunk.size);
        let opts = CacheOptions::default();

        if reader.read_cached(&key, dest, lower, opts) {
            StatsCollector::incr(&reader.stats.cache_hits);
            return Ok(());
        }

        let _gate = reader.gates.acquire(&key);
        if reader.read_cached(&key, dest, lower, opts) {
            StatsCollector::incr(&reader.stats.cache_hits);
            return Ok(());
        }
        StatsCollector::incr(&reader.stats.cache_misses);

        let aligned: bool = lower == 0 && dest.len() as u64 == chunk.size;
        if aligned {
            reader.fetch_chunk(self.file.as_ref(), &self.label, chunk, dest)?;
            reader.admit_chunk(self.id, chunk, &key, dest, opts)?;
        } else {
            let mut scratch = reader.buffers.acquire(chunk.size as usize);
            reader.fetch_chunk(self.file.as_ref(), &self.label, chunk, &mut scratch)?;
            reader.admit_chunk(self.id, chunk, &key, &scratch, opts)?;
            let start: usize = lower as usize;
            dest.copy_from_slice(&scratch[start..start + dest.len()]);
        }

        reader.stats.record_on_demand(chunk.size);
        tracing::debug!(
            file_id = self.id,
            offset = chunk.offset,
            size = chunk.size,
            "Fetched chunk on demand"
        );
        Ok(())
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}
