//! Directory-backed chunk cache.
//!
//! Chunks are stored as flat files named by key and sharded by the first two
//! hex characters of the key. A small LRU memory tier sits in front of the
//! disk and is bypassed for direct requests.

use std::fs::File;
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::key::ChunkKey;
use crate::traits::{BlobCache, BytesReader, CacheOptions, CacheReader, CacheStats, CacheWriter};

/// Default number of chunks held in the memory tier.
pub const DEFAULT_DIRECTORY_MEMORY_ENTRIES: usize = 256;

/// Name of the staging directory for uncommitted writes.
const TEMP_DIR_NAME: &str = "tmp";

/// Distinguishes staging directories of instances within one process.
static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Options for the directory cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryCacheOptions {
    /// Root directory for cached chunks.
    pub cache_dir: PathBuf,
    /// Chunks held in the memory tier. Zero disables the tier.
    pub max_memory_entries: usize,
    /// Whether to fsync each chunk before publishing it.
    pub sync_on_commit: bool,
}

impl Default for DirectoryCacheOptions {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("lazylayer-cache"),
            max_memory_entries: DEFAULT_DIRECTORY_MEMORY_ENTRIES,
            sync_on_commit: false,
        }
    }
}

impl DirectoryCacheOptions {
    /// Create options with a custom cache directory.
    ///
    /// # Arguments
    /// * `cache_dir` - Directory for chunk storage
    pub fn with_cache_dir(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            ..Default::default()
        }
    }
}

struct DirectoryCacheInner {
    cache_dir: PathBuf,
    staging_root: PathBuf,
    temp_dir: PathBuf,
    memory: Option<Mutex<LruCache<ChunkKey, Arc<Vec<u8>>>>>,
    sync_on_commit: bool,
    closed: AtomicBool,
    current_size: AtomicU64,
    temp_counter: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    evictions: AtomicU64,
}

impl DirectoryCacheInner {
    fn chunk_path(&self, key: &ChunkKey) -> PathBuf {
        self.cache_dir.join(key.shard()).join(key.as_str())
    }

    fn next_temp_path(&self, key: &ChunkKey) -> PathBuf {
        let seq: u64 = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        self.temp_dir
            .join(format!("{}.{}.{}.tmp", key, std::process::id(), seq))
    }

    fn remember(&self, key: ChunkKey, data: Arc<Vec<u8>>) {
        if let Some(memory) = &self.memory {
            if let Some((displaced, _)) = memory.lock().push(key.clone(), data) {
                if displaced != key {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn recall(&self, key: &ChunkKey) -> Option<Arc<Vec<u8>>> {
        self.memory.as_ref()?.lock().get(key).cloned()
    }
}

impl Drop for DirectoryCacheInner {
    fn drop(&mut self) {
        // Writers hold the inner, so nothing is staged here any more.
        if let Err(e) = std::fs::remove_dir_all(&self.temp_dir) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    "Failed to remove staging directory {}: {}",
                    self.temp_dir.display(),
                    e
                );
            }
        }
    }
}

/// Persistent [`BlobCache`] rooted at a directory.
///
/// # Directory Structure
/// ```text
/// cache_dir/
/// ├── 3f/
/// │   └── 3fa9c1...        # Chunk file (key as filename)
/// ├── a7/
/// │   └── a70be2...
/// └── tmp/
///     └── <pid>-<n>/       # One staging directory per open instance
/// ```
///
/// Uncommitted writes are staged in the instance's own directory and renamed
/// into place on commit, so several instances may share `cache_dir`. Staging
/// directories left behind by a crashed process are not reclaimed; remove
/// `tmp/` while no instance has the cache open.
///
/// Disk entries are never evicted; only the memory tier is bounded.
#[derive(Clone)]
pub struct DirectoryBlobCache {
    inner: Arc<DirectoryCacheInner>,
}

impl DirectoryBlobCache {
    /// Open a directory cache.
    ///
    /// # Arguments
    /// * `options` - Cache configuration options
    ///
    /// # Returns
    /// New cache instance. Creates the directory if needed, discards loose
    /// staging files, and sizes existing entries. Other instances' staging
    /// directories are left alone.
    pub fn new(options: DirectoryCacheOptions) -> Result<Self, CacheError> {
        let staging_root: PathBuf = options.cache_dir.join(TEMP_DIR_NAME);
        std::fs::create_dir_all(&staging_root)?;
        remove_loose_files(&staging_root)?;

        let instance: u64 = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir: PathBuf =
            staging_root.join(format!("{}-{}", std::process::id(), instance));
        if temp_dir.exists() {
            // Left by an earlier process that had the same pid.
            std::fs::remove_dir_all(&temp_dir)?;
        }
        std::fs::create_dir_all(&temp_dir)?;

        let memory = NonZeroUsize::new(options.max_memory_entries)
            .map(|capacity| Mutex::new(LruCache::new(capacity)));

        let cache = Self {
            inner: Arc::new(DirectoryCacheInner {
                cache_dir: options.cache_dir,
                staging_root,
                temp_dir,
                memory,
                sync_on_commit: options.sync_on_commit,
                closed: AtomicBool::new(false),
                current_size: AtomicU64::new(0),
                temp_counter: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                commits: AtomicU64::new(0),
                aborts: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        };

        cache.scan()?;
        Ok(cache)
    }

    /// Check if a chunk is on disk.
    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.inner.chunk_path(key).is_file()
    }

    /// Remove a chunk from both tiers.
    ///
    /// # Arguments
    /// * `key` - Chunk key to remove
    pub fn remove(&self, key: &ChunkKey) -> Result<(), CacheError> {
        if let Some(memory) = &self.inner.memory {
            memory.lock().pop(key);
        }

        let path: PathBuf = self.inner.chunk_path(key);
        match std::fs::metadata(&path) {
            Ok(metadata) => {
                std::fs::remove_file(&path)?;
                self.inner
                    .current_size
                    .fetch_sub(metadata.len(), Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Get current on-disk size in bytes (approximate).
    pub fn current_size(&self) -> u64 {
        self.inner.current_size.load(Ordering::Relaxed)
    }

    /// Get the cache directory path.
    pub fn cache_dir(&self) -> &Path {
        &self.inner.cache_dir
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let inner: &DirectoryCacheInner = &self.inner;
        CacheStats {
            hits: inner.hits.load(Ordering::Relaxed),
            misses: inner.misses.load(Ordering::Relaxed),
            commits: inner.commits.load(Ordering::Relaxed),
            aborts: inner.aborts.load(Ordering::Relaxed),
            evictions: inner.evictions.load(Ordering::Relaxed),
            entry_count: inner.memory.as_ref().map_or(0, |m| m.lock().len() as u64),
        }
    }

    /// Scan shard directories to rebuild size tracking.
    fn scan(&self) -> Result<(), CacheError> {
        let mut total_size: u64 = 0;
        let mut files: u64 = 0;

        for shard in std::fs::read_dir(&self.inner.cache_dir)? {
            let shard = shard?;
            let shard_path: PathBuf = shard.path();
            if !shard_path.is_dir() || shard_path == self.inner.staging_root {
                continue;
            }
            for entry in std::fs::read_dir(&shard_path)? {
                let entry = entry?;
                if let Ok(metadata) = entry.metadata() {
                    if metadata.is_file() {
                        total_size += metadata.len();
                        files += 1;
                    }
                }
            }
        }

        tracing::debug!(
            "Chunk cache at {} holds {} files ({} bytes)",
            self.inner.cache_dir.display(),
            files,
            total_size
        );
        self.inner.current_size.store(total_size, Ordering::Relaxed);
        Ok(())
    }

    fn check_open(&self) -> Result<(), CacheError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }
}

/// Remove regular files directly under `dir`, keeping subdirectories.
fn remove_loose_files(dir: &Path) -> Result<(), CacheError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

impl BlobCache for DirectoryBlobCache {
    fn get(
        &self,
        key: &ChunkKey,
        opts: CacheOptions,
    ) -> Result<Option<Box<dyn CacheReader>>, CacheError> {
        self.check_open()?;

        if !opts.direct {
            if let Some(data) = self.inner.recall(key) {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(Box::new(BytesReader::new(data))));
            }
        }

        match std::fs::read(self.inner.chunk_path(key)) {
            Ok(data) => {
                let data: Arc<Vec<u8>> = Arc::new(data);
                if !opts.direct {
                    self.inner.remember(key.clone(), data.clone());
                }
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(Box::new(BytesReader::new(data))))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &ChunkKey, opts: CacheOptions) -> Result<bool, CacheError> {
        self.check_open()?;
        if !opts.direct && self.inner.recall(key).is_some() {
            return Ok(true);
        }
        match std::fs::metadata(self.inner.chunk_path(key)) {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn add(
        &self,
        key: &ChunkKey,
        declared_len: u64,
        opts: CacheOptions,
    ) -> Result<Box<dyn CacheWriter>, CacheError> {
        self.check_open()?;

        let temp_path: PathBuf = self.inner.next_temp_path(key);
        let file: File = File::create(&temp_path)?;
        let mirror: Option<Vec<u8>> = if opts.direct || self.inner.memory.is_none() {
            None
        } else {
            Some(Vec::with_capacity(declared_len as usize))
        };

        Ok(Box::new(DirectoryCacheWriter {
            inner: self.inner.clone(),
            key: key.clone(),
            declared_len,
            written: 0,
            temp_path,
            file: Some(file),
            mirror,
            finished: false,
        }))
    }

    fn close(&self) -> Result<(), CacheError> {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            if let Some(memory) = &self.inner.memory {
                memory.lock().clear();
            }
        }
        Ok(())
    }
}

/// Writer staging a chunk in the temp directory until commit.
struct DirectoryCacheWriter {
    inner: Arc<DirectoryCacheInner>,
    key: ChunkKey,
    declared_len: u64,
    written: u64,
    temp_path: PathBuf,
    file: Option<File>,
    mirror: Option<Vec<u8>>,
    finished: bool,
}

impl DirectoryCacheWriter {
    /// Drop the staged file and count an abort.
    fn discard(&mut self) {
        self.finished = true;
        self.file = None;
        if let Err(e) = std::fs::remove_file(&self.temp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    "Failed to remove staged chunk {}: {}",
                    self.temp_path.display(),
                    e
                );
            }
        }
        self.inner.aborts.fetch_add(1, Ordering::Relaxed);
    }

    fn publish(&mut self) -> Result<(), CacheError> {
        let mut file: File = match self.file.take() {
            Some(file) => file,
            None => return Err(CacheError::Closed),
        };
        file.flush()?;
        if self.inner.sync_on_commit {
            file.sync_all()?;
        }
        drop(file);

        let path: PathBuf = self.inner.chunk_path(&self.key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let previous: u64 = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        std::fs::rename(&self.temp_path, &path)?;

        self.inner
            .current_size
            .fetch_add(self.written, Ordering::Relaxed);
        self.inner
            .current_size
            .fetch_sub(previous, Ordering::Relaxed);
        Ok(())
    }
}

impl io::Write for DirectoryCacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file: &mut File = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "writer finished"))?;
        let n: usize = file.write(buf)?;
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.extend_from_slice(&buf[..n]);
        }
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl CacheWriter for DirectoryCacheWriter {
    fn commit(mut self: Box<Self>) -> Result<(), CacheError> {
        if self.written != self.declared_len {
            let err = CacheError::ShortWrite {
                expected: self.declared_len,
                actual: self.written,
            };
            self.discard();
            return Err(err);
        }
        if self.inner.closed.load(Ordering::Acquire) {
            self.discard();
            return Err(CacheError::Closed);
        }

        if let Err(e) = self.publish() {
            self.discard();
            return Err(e);
        }

        self.finished = true;
        self.inner.commits.fetch_add(1, Ordering::Relaxed);
        if let Some(data) = self.mirror.take() {
            self.inner.remember(self.key.clone(), Arc::new(data));
        }
        Ok(())
    }

    fn abort(mut self: Box<Self>) {
        self.discard();
    }
}

impl Drop for DirectoryCacheWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.discard();
        }
    }
}
