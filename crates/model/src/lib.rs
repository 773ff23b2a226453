//! Layer metadata model for lazily fetched, chunk-verified layers.
//!
//! This crate defines the vocabulary shared by the chunk cache and the
//! verifying reader:
//! - `digest` - `sha256:<hex>` digests and a streaming verifier
//! - `entry` - entry IDs, kinds, attributes and chunk descriptors
//! - `metadata` - the `MetadataReader` / `ChunkedFile` / `BlobReader` contracts
//! - `memory` - an in-memory layer implementing those contracts

pub mod digest;
pub mod entry;
pub mod error;
pub mod memory;
pub mod metadata;

pub use digest::{Digest, DigestAlgorithm, DigestVerifier};
pub use entry::{ChildEntry, ChunkEntry, EntryAttr, EntryId, EntryKind, ROOT_ENTRY};
pub use error::ModelError;
pub use memory::{MemoryBlob, MemoryLayer, MemoryLayerBuilder, MemoryMetadataReader, TOC_ENTRY_NAME};
pub use metadata::{BlobReader, BoxError, ChunkedFile, MetadataReader, PreReadHook};
