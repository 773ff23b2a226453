//! Content-addressed chunk cache for lazily fetched layers.
//!
//! Verified chunks are stored under a [`ChunkKey`] derived from the file ID,
//! chunk offset and chunk size. Writers are two-phase: nothing is visible
//! until [`CacheWriter::commit`] succeeds, and dropping a writer discards it.
//!
//! Two backends are provided:
//!
//! - [`MemoryBlobCache`] - Bounded in-memory LRU
//! - [`DirectoryBlobCache`] - Sharded files on disk with an LRU memory tier

mod directory;
mod error;
mod key;
mod memory;
mod traits;

pub use directory::{DirectoryBlobCache, DirectoryCacheOptions, DEFAULT_DIRECTORY_MEMORY_ENTRIES};
pub use error::CacheError;
pub use key::ChunkKey;
pub use memory::{MemoryBlobCache, MemoryCacheOptions, DEFAULT_MAX_MEMORY_ENTRIES};
pub use traits::{BlobCache, BytesReader, CacheOptions, CacheReader, CacheStats, CacheWriter};
