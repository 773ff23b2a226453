//! Lazy layer reader with verified on-demand chunk fetch.
//!
//! A layer is a blob plus a table of contents (ToC) describing each file's
//! chunks and their digests. This crate reads files out of such a layer
//! without downloading it up front:
//!
//! - Reads resolve to whole chunks, served from a [`BlobCache`] when present
//!   and otherwise fetched from the transport, verified and cached.
//! - [`VerifiableReader::verify_toc`] pins the ToC to a trusted digest. Before
//!   that, corrupt chunks are tolerated and remembered; after it, they fail.
//! - [`VerifiableReader::cache`] warms the cache for the whole layer.
//!
//! # Architecture
//!
//! ```text
//! VerifiableReader ──verify_toc/skip_verify──► Arc<dyn Reader>
//!        │                                          │ open_file
//!        │ cache()                                  ▼
//!        ▼                                      FileHandle::read_at
//!   prefetch walker ──► blocking pool               │
//!        │                                          │
//!        └────────────► BlobCache ◄─────────────────┘
//!                          ▲
//!                 MetadataReader / ChunkedFile (transport)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use lazylayer_model::MemoryLayerBuilder;
//! use lazylayer_reader::{ReaderOptions, VerifiableReader};
//! use lazylayer_storage::MemoryBlobCache;
//!
//! let layer = MemoryLayerBuilder::new().file("a.txt", b"hello".to_vec()).build()?;
//! let toc = layer.reader.toc_digest();
//! let reader = VerifiableReader::new(
//!     Arc::new(layer.reader.clone()),
//!     Arc::new(MemoryBlobCache::default()),
//!     toc.clone(),
//!     ReaderOptions::default(),
//! );
//! let files = reader.verify_toc(&toc)?;
//! let file = files.open_file(layer.reader.lookup("a.txt").unwrap())?;
//! ```
//!
//! [`BlobCache`]: lazylayer_storage::BlobCache

pub mod buffer_pool;
pub mod error;
pub mod file;
mod inflight;
pub mod options;
mod prefetch;
pub mod reader;
pub mod stats;
pub mod verifiable;
pub mod verify;

pub use buffer_pool::{BufferPool, BufferPoolStats, PooledBuffer};
pub use error::{ReaderError, VerifyError};
pub use file::FileHandle;
pub use options::{
    BufferPoolConfig, PrefetchFilter, PrefetchOptions, ReaderOptions, DEFAULT_MAX_WALK_DEPTH,
};
pub use reader::Reader;
pub use stats::ReaderStats;
pub use verifiable::VerifiableReader;
pub use verify::verify_chunk;
