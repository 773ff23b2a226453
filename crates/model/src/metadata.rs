//! Metadata reader and transport contracts.
//!
//! A layer is a blob plus a table of contents (ToC) describing every entry and
//! the chunk layout of every regular file. The engine in `lazylayer-reader`
//! consumes these traits; the format-specific parsing lives behind them.

use std::io;
use std::sync::Arc;

use crate::digest::Digest;
use crate::entry::{ChildEntry, ChunkEntry, EntryAttr, EntryId};
use crate::error::ModelError;

/// Boxed error returned through type-erased callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Hook invoked with chunks the transport decoded incidentally while serving
/// another read (for example, neighbours sharing a compressed span).
///
/// Arguments are the file ID, the chunk, and the chunk's full content.
pub type PreReadHook = Arc<dyn Fn(EntryId, &ChunkEntry, &[u8]) -> Result<(), BoxError> + Send + Sync>;

/// Random-access reader over the raw layer blob.
pub trait BlobReader: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`.
    ///
    /// Returns fewer bytes only at the end of the blob.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Total blob size in bytes.
    fn size(&self) -> u64;
}

/// An opened regular file backed by the transport.
pub trait ChunkedFile: Send + Sync {
    /// Find the chunk covering `offset`, if any.
    fn chunk_entry_for_offset(&self, offset: u64) -> Option<ChunkEntry>;

    /// Read uncompressed file content at `offset` from the transport.
    ///
    /// Returns fewer bytes than requested only at end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

/// Read-only view of a layer's table of contents.
pub trait MetadataReader: Send + Sync {
    /// ID of the root directory.
    fn root_id(&self) -> EntryId;

    /// Digest of the table of contents; the root of trust for the layer.
    fn toc_digest(&self) -> Digest;

    /// Visit the children of `dir` in name order until `visit` returns false.
    ///
    /// # Arguments
    /// * `dir` - Directory entry ID
    /// * `visit` - Callback receiving each child; return false to stop
    fn foreach_child(
        &self,
        dir: EntryId,
        visit: &mut dyn FnMut(&ChildEntry) -> bool,
    ) -> Result<(), ModelError>;

    /// Get the attributes of an entry.
    fn get_attr(&self, id: EntryId) -> Result<EntryAttr, ModelError>;

    /// Get the byte offset of an entry's payload within the blob.
    fn get_offset(&self, id: EntryId) -> Result<u64, ModelError>;

    /// Open a regular file, optionally registering a pre-read hook.
    fn open_file(
        &self,
        id: EntryId,
        pre_read: Option<PreReadHook>,
    ) -> Result<Arc<dyn ChunkedFile>, ModelError>;

    /// Create a reader over the same ToC that fetches from another blob.
    fn clone_with_blob(
        &self,
        blob: Arc<dyn BlobReader>,
    ) -> Result<Arc<dyn MetadataReader>, ModelError>;

    /// Release resources held by the reader. Idempotent.
    fn close(&self) -> Result<(), ModelError>;
}
