//! In-memory layer for testing and embedding.
//!
//! [`MemoryLayerBuilder`] lays files out back-to-back in a blob, splits each
//! file into fixed-size chunks with SHA-256 digests, and serialises a JSON
//! table of contents whose SHA-256 becomes the layer's ToC digest. The ToC
//! itself is appended to the blob and exposed as a tagged pseudo-entry under
//! the root directory.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::entry::{
    ChildEntry, ChunkEntry, EntryAttr, EntryId, EntryKind, DEFAULT_DIR_PERMS, DEFAULT_FILE_PERMS,
    ROOT_ENTRY,
};
use crate::error::ModelError;
use crate::metadata::{BlobReader, ChunkedFile, MetadataReader, PreReadHook};

/// Name of the table-of-contents pseudo-entry under the root directory.
pub const TOC_ENTRY_NAME: &str = ".toc.json";

/// Default chunk size (4 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

// ============================================================================
// Blob
// ============================================================================

/// In-memory blob that counts transport reads.
#[derive(Debug, Default)]
pub struct MemoryBlob {
    /// Raw blob bytes.
    data: RwLock<Vec<u8>>,
    /// Number of read_at calls.
    read_count: AtomicU64,
    /// Total bytes returned by read_at.
    bytes_read: AtomicU64,
    /// When set, every read fails.
    fail_reads: AtomicBool,
}

impl MemoryBlob {
    /// Create a blob over `data`.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            ..Default::default()
        }
    }

    /// Number of reads served so far.
    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    /// Total bytes served so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Reset the read counters.
    pub fn reset_counts(&self) {
        self.read_count.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
    }

    /// Flip the byte at `offset` so the covering chunk no longer matches its digest.
    pub fn tamper(&self, offset: u64) {
        let mut data = self.data.write();
        if let Some(byte) = data.get_mut(offset as usize) {
            *byte ^= 0xff;
        }
    }

    /// Make subsequent reads fail (or succeed again).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }
}

impl BlobReader for MemoryBlob {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "blob transport unavailable",
            ));
        }

        let data = self.data.read();
        let start: usize = (offset as usize).min(data.len());
        let end: usize = (start + buf.len()).min(data.len());
        let n: usize = end - start;
        buf[..n].copy_from_slice(&data[start..end]);

        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }
}

/// Read until `buf` is full or the blob ends.
fn read_full_at(blob: &dyn BlobReader, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled: usize = 0;
    while filled < buf.len() {
        let n: usize = blob.read_at(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// ============================================================================
// Table of contents
// ============================================================================

/// Serialised form of one ToC entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TocEntry {
    id: EntryId,
    name: String,
    #[serde(rename = "type")]
    kind: EntryKind,
    size: u64,
    mode: u16,
    offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    link_target: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    chunks: Vec<ChunkEntry>,
}

/// Serialised table of contents.
#[derive(Debug, Serialize, Deserialize)]
struct Toc {
    version: u32,
    entries: Vec<TocEntry>,
}

/// Indexed view of the ToC shared by all readers of one layer.
#[derive(Debug)]
struct TocIndex {
    entries: HashMap<EntryId, TocEntry>,
    children: HashMap<EntryId, BTreeMap<String, EntryId>>,
    paths: HashMap<String, EntryId>,
    toc_id: EntryId,
    digest: Digest,
}

// ============================================================================
// Builder
// ============================================================================

enum PendingEntry {
    Dir(String),
    File(String, Vec<u8>),
    Symlink(String, String),
}

/// Builds an in-memory layer.
///
/// # Example
///
/// ```
/// use lazylayer_model::{MemoryLayerBuilder, MetadataReader};
///
/// let layer = MemoryLayerBuilder::new()
///     .with_chunk_size(4)
///     .file("etc/hostname", b"ABCDEFGH".to_vec())
///     .build()
///     .unwrap();
/// let id = layer.reader.lookup("etc/hostname").unwrap();
/// assert_eq!(layer.reader.get_attr(id).unwrap().size, 8);
/// ```
pub struct MemoryLayerBuilder {
    chunk_size: u64,
    neighbor_pre_read: bool,
    pending: Vec<PendingEntry>,
}

impl Default for MemoryLayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLayerBuilder {
    /// Create an empty builder with the default chunk size.
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            neighbor_pre_read: false,
            pending: Vec::new(),
        }
    }

    /// Set the chunk size used to split file content.
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// When enabled, reading a chunk also decodes the following chunk and
    /// passes it to the file's pre-read hook.
    pub fn with_neighbor_pre_read(mut self, enabled: bool) -> Self {
        self.neighbor_pre_read = enabled;
        self
    }

    /// Add a directory (parents are created implicitly).
    pub fn dir(mut self, path: impl Into<String>) -> Self {
        self.pending.push(PendingEntry::Dir(path.into()));
        self
    }

    /// Add a regular file.
    pub fn file(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.pending
            .push(PendingEntry::File(path.into(), content.into()));
        self
    }

    /// Add a symbolic link.
    pub fn symlink(mut self, path: impl Into<String>, target: impl Into<String>) -> Self {
        self.pending
            .push(PendingEntry::Symlink(path.into(), target.into()));
        self
    }

    /// Lay out the blob and index the ToC.
    pub fn build(self) -> Result<MemoryLayer, ModelError> {
        let mut state = BuildState::new();

        for pending in self.pending {
            match pending {
                PendingEntry::Dir(path) => {
                    let components: Vec<&str> = split_path(&path)?;
                    state.ensure_dir(&components)?;
                }
                PendingEntry::File(path, content) => {
                    state.add_file(&path, content, self.chunk_size)?;
                }
                PendingEntry::Symlink(path, target) => {
                    state.add_leaf(&path, EntryKind::Symlink, 0, Some(target), Vec::new())?;
                }
            }
        }

        state.finish(self.neighbor_pre_read)
    }
}

/// Mutable state while building a layer.
struct BuildState {
    blob: Vec<u8>,
    entries: Vec<TocEntry>,
    paths: HashMap<String, EntryId>,
    next_id: EntryId,
}

impl BuildState {
    fn new() -> Self {
        let root = TocEntry {
            id: ROOT_ENTRY,
            name: String::new(),
            kind: EntryKind::Directory,
            size: 0,
            mode: DEFAULT_DIR_PERMS,
            offset: 0,
            link_target: None,
            chunks: Vec::new(),
        };
        let mut paths: HashMap<String, EntryId> = HashMap::new();
        paths.insert(String::new(), ROOT_ENTRY);

        Self {
            blob: Vec::new(),
            entries: vec![root],
            paths,
            // ROOT_ENTRY + 1 is reserved for the ToC pseudo-entry.
            next_id: ROOT_ENTRY + 2,
        }
    }

    fn allocate_id(&mut self) -> EntryId {
        let id: EntryId = self.next_id;
        self.next_id += 1;
        id
    }

    fn ensure_dir(&mut self, components: &[&str]) -> Result<EntryId, ModelError> {
        let mut path: String = String::new();
        let mut id: EntryId = ROOT_ENTRY;

        for component in components {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(component);

            id = match self.paths.get(&path) {
                Some(&existing) => {
                    let is_dir: bool = self
                        .entries
                        .iter()
                        .any(|e| e.id == existing && e.kind.is_dir());
                    if !is_dir {
                        return Err(ModelError::InvalidPath(path));
                    }
                    existing
                }
                None => {
                    let new_id: EntryId = self.allocate_id();
                    self.entries.push(TocEntry {
                        id: new_id,
                        name: path.clone(),
                        kind: EntryKind::Directory,
                        size: 0,
                        mode: DEFAULT_DIR_PERMS,
                        offset: 0,
                        link_target: None,
                        chunks: Vec::new(),
                    });
                    self.paths.insert(path.clone(), new_id);
                    new_id
                }
            };
        }

        Ok(id)
    }

    fn add_file(&mut self, path: &str, content: Vec<u8>, chunk_size: u64) -> Result<(), ModelError> {
        let size: u64 = content.len() as u64;
        let chunks: Vec<ChunkEntry> = content
            .chunks(chunk_size as usize)
            .enumerate()
            .map(|(i, chunk)| {
                ChunkEntry::new(
                    i as u64 * chunk_size,
                    chunk.len() as u64,
                    Digest::sha256(chunk).to_string(),
                )
            })
            .collect();

        let offset: u64 = self.blob.len() as u64;
        self.add_leaf(path, EntryKind::Regular, size, None, chunks)?;
        if let Some(entry) = self.entries.last_mut() {
            entry.offset = offset;
        }
        self.blob.extend_from_slice(&content);
        Ok(())
    }

    fn add_leaf(
        &mut self,
        path: &str,
        kind: EntryKind,
        size: u64,
        link_target: Option<String>,
        chunks: Vec<ChunkEntry>,
    ) -> Result<(), ModelError> {
        let components: Vec<&str> = split_path(path)?;
        let normalized: String = components.join("/");
        if self.paths.contains_key(&normalized) {
            return Err(ModelError::InvalidPath(normalized));
        }
        self.ensure_dir(&components[..components.len() - 1])?;

        let id: EntryId = self.allocate_id();
        self.entries.push(TocEntry {
            id,
            name: normalized.clone(),
            kind,
            size,
            mode: DEFAULT_FILE_PERMS,
            offset: 0,
            link_target,
            chunks,
        });
        self.paths.insert(normalized, id);
        Ok(())
    }

    fn finish(mut self, neighbor_pre_read: bool) -> Result<MemoryLayer, ModelError> {
        let toc = Toc {
            version: 1,
            entries: self.entries,
        };
        let toc_json: Vec<u8> = serde_json::to_vec(&toc)?;
        let digest: Digest = Digest::sha256(&toc_json);

        let toc_id: EntryId = ROOT_ENTRY + 1;
        let toc_entry = TocEntry {
            id: toc_id,
            name: TOC_ENTRY_NAME.to_string(),
            kind: EntryKind::Regular,
            size: toc_json.len() as u64,
            mode: DEFAULT_FILE_PERMS,
            offset: self.blob.len() as u64,
            link_target: None,
            chunks: vec![ChunkEntry::new(0, toc_json.len() as u64, digest.to_string())],
        };
        self.blob.extend_from_slice(&toc_json);

        let mut entries: HashMap<EntryId, TocEntry> = HashMap::new();
        let mut children: HashMap<EntryId, BTreeMap<String, EntryId>> = HashMap::new();
        for entry in toc.entries.into_iter().chain(std::iter::once(toc_entry)) {
            if entry.id != ROOT_ENTRY {
                let (parent_path, base) = match entry.name.rsplit_once('/') {
                    Some((parent, base)) => (parent.to_string(), base.to_string()),
                    None => (String::new(), entry.name.clone()),
                };
                let parent: EntryId = self
                    .paths
                    .get(&parent_path)
                    .copied()
                    .ok_or_else(|| ModelError::InvalidPath(entry.name.clone()))?;
                children.entry(parent).or_default().insert(base, entry.id);
            }
            if entry.kind.is_dir() {
                children.entry(entry.id).or_default();
            }
            entries.insert(entry.id, entry);
        }

        let index = TocIndex {
            entries,
            children,
            paths: self.paths,
            toc_id,
            digest,
        };
        let blob: Arc<MemoryBlob> = Arc::new(MemoryBlob::new(self.blob));
        let reader = MemoryMetadataReader {
            toc: Arc::new(index),
            blob: blob.clone(),
            neighbor_pre_read,
            closed: Arc::new(AtomicBool::new(false)),
        };

        Ok(MemoryLayer { reader, blob })
    }
}

/// Split a layer path into its components, rejecting empty and relative parts.
fn split_path(path: &str) -> Result<Vec<&str>, ModelError> {
    let components: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|c| !c.is_empty())
        .collect();
    if components.is_empty() || components.iter().any(|c| *c == "." || *c == "..") {
        return Err(ModelError::InvalidPath(path.to_string()));
    }
    Ok(components)
}

// ============================================================================
// Reader
// ============================================================================

/// A built in-memory layer.
pub struct MemoryLayer {
    /// Metadata reader over the layer.
    pub reader: MemoryMetadataReader,
    /// The blob the reader fetches from.
    pub blob: Arc<MemoryBlob>,
}

/// Metadata reader over an in-memory ToC.
#[derive(Clone)]
pub struct MemoryMetadataReader {
    toc: Arc<TocIndex>,
    blob: Arc<dyn BlobReader>,
    neighbor_pre_read: bool,
    closed: Arc<AtomicBool>,
}

impl MemoryMetadataReader {
    /// Look up an entry by its layer path (no leading slash).
    pub fn lookup(&self, path: &str) -> Option<EntryId> {
        self.toc.paths.get(path.trim_matches('/')).copied()
    }

    /// ID of the table-of-contents pseudo-entry.
    pub fn toc_entry_id(&self) -> EntryId {
        self.toc.toc_id
    }

    /// Check whether [`MetadataReader::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn entry(&self, id: EntryId) -> Result<&TocEntry, ModelError> {
        self.toc.entries.get(&id).ok_or(ModelError::EntryNotFound(id))
    }
}

impl MetadataReader for MemoryMetadataReader {
    fn root_id(&self) -> EntryId {
        ROOT_ENTRY
    }

    fn toc_digest(&self) -> Digest {
        self.toc.digest.clone()
    }

    fn foreach_child(
        &self,
        dir: EntryId,
        visit: &mut dyn FnMut(&ChildEntry) -> bool,
    ) -> Result<(), ModelError> {
        let entry: &TocEntry = self.entry(dir)?;
        if !entry.kind.is_dir() {
            return Err(ModelError::NotADirectory(dir));
        }

        let Some(children) = self.toc.children.get(&dir) else {
            return Ok(());
        };
        for (name, &id) in children {
            let child: &TocEntry = self.entry(id)?;
            let visited = ChildEntry {
                name: name.clone(),
                id,
                kind: child.kind,
                is_toc: id == self.toc.toc_id,
            };
            if !visit(&visited) {
                break;
            }
        }
        Ok(())
    }

    fn get_attr(&self, id: EntryId) -> Result<EntryAttr, ModelError> {
        let entry: &TocEntry = self.entry(id)?;
        Ok(EntryAttr {
            size: entry.size,
            kind: entry.kind,
            permissions: entry.mode,
            link_target: entry.link_target.clone(),
        })
    }

    fn get_offset(&self, id: EntryId) -> Result<u64, ModelError> {
        Ok(self.entry(id)?.offset)
    }

    fn open_file(
        &self,
        id: EntryId,
        pre_read: Option<PreReadHook>,
    ) -> Result<Arc<dyn ChunkedFile>, ModelError> {
        if self.is_closed() {
            return Err(ModelError::Closed);
        }
        let entry: &TocEntry = self.entry(id)?;
        if !entry.kind.is_regular() {
            return Err(ModelError::NotAFile(id));
        }

        Ok(Arc::new(MemoryFile {
            id,
            blob_offset: entry.offset,
            size: entry.size,
            chunks: entry.chunks.clone(),
            blob: self.blob.clone(),
            pre_read: if self.neighbor_pre_read { pre_read } else { None },
        }))
    }

    fn clone_with_blob(
        &self,
        blob: Arc<dyn BlobReader>,
    ) -> Result<Arc<dyn MetadataReader>, ModelError> {
        Ok(Arc::new(MemoryMetadataReader {
            toc: self.toc.clone(),
            blob,
            neighbor_pre_read: self.neighbor_pre_read,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn close(&self) -> Result<(), ModelError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// An opened in-memory file.
struct MemoryFile {
    id: EntryId,
    blob_offset: u64,
    size: u64,
    chunks: Vec<ChunkEntry>,
    blob: Arc<dyn BlobReader>,
    pre_read: Option<PreReadHook>,
}

impl MemoryFile {
    /// Decode the chunk starting at `end` and hand it to the pre-read hook.
    fn pre_read_next(&self, hook: &PreReadHook, end: u64) {
        let Some(next) = self.chunks.iter().find(|c| c.offset == end) else {
            return;
        };
        let mut data: Vec<u8> = vec![0u8; next.size as usize];
        match read_full_at(self.blob.as_ref(), &mut data, self.blob_offset + next.offset) {
            Ok(n) if n == data.len() => {
                // Hook failures only mean the neighbour was not cached.
                if let Err(e) = hook(self.id, next, &data) {
                    tracing::debug!(
                        file_id = self.id,
                        offset = next.offset,
                        size = next.size,
                        "Pre-read hook rejected neighbour chunk: {}",
                        e
                    );
                }
            }
            _ => {}
        }
    }
}

impl ChunkedFile for MemoryFile {
    fn chunk_entry_for_offset(&self, offset: u64) -> Option<ChunkEntry> {
        let idx: usize = self.chunks.partition_point(|c| c.end() <= offset);
        self.chunks
            .get(idx)
            .filter(|c| c.contains(offset))
            .cloned()
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let want: usize = buf.len().min((self.size - offset) as usize);
        let n: usize = read_full_at(self.blob.as_ref(), &mut buf[..want], self.blob_offset + offset)?;

        if let Some(hook) = &self.pre_read {
            let end: u64 = offset + n as u64;
            let ends_on_boundary: bool = self.chunks.iter().any(|c| c.end() == end);
            if ends_on_boundary && end < self.size {
                self.pre_read_next(hook, end);
            }
        }

        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::metadata::BoxError;

    fn sample_layer() -> MemoryLayer {
        MemoryLayerBuilder::new()
            .with_chunk_size(4)
            .file("a.txt", b"ABCDEFGH".to_vec())
            .file("dir/sub/b.txt", b"0123456789".to_vec())
            .dir("empty")
            .symlink("dir/link", "../a.txt")
            .build()
            .unwrap()
    }

    fn child_names(reader: &MemoryMetadataReader, dir: EntryId) -> Vec<(String, bool)> {
        let mut names: Vec<(String, bool)> = Vec::new();
        reader
            .foreach_child(dir, &mut |child| {
                names.push((child.name.clone(), child.is_toc));
                true
            })
            .unwrap();
        names
    }

    #[test]
    fn test_tree_layout() {
        let layer: MemoryLayer = sample_layer();
        let reader: &MemoryMetadataReader = &layer.reader;

        let root: Vec<(String, bool)> = child_names(reader, reader.root_id());
        assert_eq!(
            root,
            vec![
                (".toc.json".to_string(), true),
                ("a.txt".to_string(), false),
                ("dir".to_string(), false),
                ("empty".to_string(), false),
            ]
        );

        let dir: EntryId = reader.lookup("dir").unwrap();
        let names: Vec<(String, bool)> = child_names(reader, dir);
        assert_eq!(names.len(), 2);

        let link: EntryId = reader.lookup("dir/link").unwrap();
        let attr: EntryAttr = reader.get_attr(link).unwrap();
        assert_eq!(attr.kind, EntryKind::Symlink);
        assert_eq!(attr.link_target.as_deref(), Some("../a.txt"));
    }

    #[test]
    fn test_chunk_map() {
        let layer: MemoryLayer = sample_layer();
        let id: EntryId = layer.reader.lookup("dir/sub/b.txt").unwrap();
        let file: Arc<dyn ChunkedFile> = layer.reader.open_file(id, None).unwrap();

        let first: ChunkEntry = file.chunk_entry_for_offset(0).unwrap();
        assert_eq!((first.offset, first.size), (0, 4));
        assert_eq!(first.digest, Digest::sha256(b"0123").to_string());

        let last: ChunkEntry = file.chunk_entry_for_offset(9).unwrap();
        assert_eq!((last.offset, last.size), (8, 2));
        assert!(file.chunk_entry_for_offset(10).is_none());
    }

    #[test]
    fn test_file_read_at() {
        let layer: MemoryLayer = sample_layer();
        let id: EntryId = layer.reader.lookup("dir/sub/b.txt").unwrap();
        let file: Arc<dyn ChunkedFile> = layer.reader.open_file(id, None).unwrap();

        let mut buf: [u8; 6] = [0; 6];
        assert_eq!(file.read_at(&mut buf, 6).unwrap(), 4);
        assert_eq!(&buf[..4], b"6789");
        assert_eq!(file.read_at(&mut buf, 10).unwrap(), 0);
    }

    #[test]
    fn test_toc_digest_is_deterministic() {
        let a: MemoryLayer = sample_layer();
        let b: MemoryLayer = sample_layer();
        assert_eq!(a.reader.toc_digest(), b.reader.toc_digest());

        let other: MemoryLayer = MemoryLayerBuilder::new()
            .file("a.txt", b"different".to_vec())
            .build()
            .unwrap();
        assert_ne!(a.reader.toc_digest(), other.reader.toc_digest());
    }

    #[test]
    fn test_toc_entry_content_matches_digest() {
        let layer: MemoryLayer = sample_layer();
        let toc_id: EntryId = layer.reader.toc_entry_id();
        let size: u64 = layer.reader.get_attr(toc_id).unwrap().size;
        let file: Arc<dyn ChunkedFile> = layer.reader.open_file(toc_id, None).unwrap();

        let mut buf: Vec<u8> = vec![0; size as usize];
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(Digest::sha256(&buf), layer.reader.toc_digest());
    }

    #[test]
    fn test_builder_rejects_bad_paths() {
        assert!(MemoryLayerBuilder::new().file("", b"x".to_vec()).build().is_err());
        assert!(MemoryLayerBuilder::new().file("../x", b"x".to_vec()).build().is_err());
        assert!(MemoryLayerBuilder::new()
            .file("a", b"x".to_vec())
            .file("a", b"y".to_vec())
            .build()
            .is_err());
        assert!(MemoryLayerBuilder::new()
            .file("a", b"x".to_vec())
            .file("a/b", b"y".to_vec())
            .build()
            .is_err());
    }

    #[test]
    fn test_open_non_regular_fails() {
        let layer: MemoryLayer = sample_layer();
        let dir: EntryId = layer.reader.lookup("dir").unwrap();
        assert!(matches!(
            layer.reader.open_file(dir, None),
            Err(ModelError::NotAFile(_))
        ));
        assert!(matches!(
            layer.reader.foreach_child(layer.reader.lookup("a.txt").unwrap(), &mut |_| true),
            Err(ModelError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_neighbor_pre_read_invokes_hook() {
        let layer: MemoryLayer = MemoryLayerBuilder::new()
            .with_chunk_size(4)
            .with_neighbor_pre_read(true)
            .file("a.txt", b"ABCDEFGHIJ".to_vec())
            .build()
            .unwrap();
        let id: EntryId = layer.reader.lookup("a.txt").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let hook: PreReadHook = Arc::new(
            move |_id: EntryId, chunk: &ChunkEntry, data: &[u8]| -> Result<(), BoxError> {
                assert_eq!(chunk.offset, 4);
                assert_eq!(data, b"EFGH");
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        let file: Arc<dyn ChunkedFile> = layer.reader.open_file(id, Some(hook)).unwrap();
        let mut buf: [u8; 4] = [0; 4];
        file.read_at(&mut buf, 0).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_pre_read_hook_does_not_fail_read() {
        let layer: MemoryLayer = MemoryLayerBuilder::new()
            .with_chunk_size(4)
            .with_neighbor_pre_read(true)
            .file("a.txt", b"ABCDEFGH".to_vec())
            .build()
            .unwrap();
        let id: EntryId = layer.reader.lookup("a.txt").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let hook: PreReadHook = Arc::new(
            move |_id: EntryId, _chunk: &ChunkEntry, _data: &[u8]| -> Result<(), BoxError> {
                seen.fetch_add(1, Ordering::SeqCst);
                Err("neighbour rejected".into())
            },
        );

        let file: Arc<dyn ChunkedFile> = layer.reader.open_file(id, Some(hook)).unwrap();
        let mut buf: [u8; 4] = [0; 4];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 4);
        assert_eq!(&buf, b"ABCD");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blob_tamper_and_failures() {
        let layer: MemoryLayer = sample_layer();
        let blob: &MemoryBlob = &layer.blob;

        let mut buf: [u8; 1] = [0; 1];
        blob.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"A");

        blob.tamper(0);
        blob.read_at(&mut buf, 0).unwrap();
        assert_ne!(&buf, b"A");
        assert_eq!(blob.read_count(), 2);

        blob.set_fail_reads(true);
        assert!(blob.read_at(&mut buf, 0).is_err());
    }

    #[test]
    fn test_clone_with_blob_reads_other_blob() {
        let layer: MemoryLayer = sample_layer();
        let mirror = Arc::new(MemoryBlob::new(vec![b'z'; layer.blob.size() as usize]));
        let cloned: Arc<dyn MetadataReader> = layer.reader.clone_with_blob(mirror.clone()).unwrap();

        assert_eq!(cloned.toc_digest(), layer.reader.toc_digest());
        let id: EntryId = layer.reader.lookup("a.txt").unwrap();
        let file: Arc<dyn ChunkedFile> = cloned.open_file(id, None).unwrap();
        let mut buf: [u8; 2] = [0; 2];
        file.read_at(&mut buf, 0).unwrap();

        assert_eq!(&buf, b"zz");
        assert_eq!(mirror.read_count(), 1);
        assert_eq!(layer.blob.read_count(), 0);
    }
}
