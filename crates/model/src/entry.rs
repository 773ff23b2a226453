//! Layer entry and chunk types.

use serde::{Deserialize, Serialize};

/// Numeric identifier of an entry within one layer.
pub type EntryId = u32;

/// Root directory entry ID.
pub const ROOT_ENTRY: EntryId = 1;

/// Default file permissions (rw-r--r--).
pub const DEFAULT_FILE_PERMS: u16 = 0o644;

/// Default directory permissions (rwxr-xr-x).
pub const DEFAULT_DIR_PERMS: u16 = 0o755;

/// Type of a layer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Device nodes, fifos, sockets.
    Other,
}

impl EntryKind {
    /// Check if this is a regular file.
    pub fn is_regular(&self) -> bool {
        matches!(self, EntryKind::Regular)
    }

    /// Check if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, EntryKind::Directory)
    }
}

/// Attributes of a layer entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryAttr {
    /// Uncompressed size in bytes (0 for non-regular entries).
    pub size: u64,
    /// Entry type.
    pub kind: EntryKind,
    /// POSIX permission bits.
    pub permissions: u16,
    /// Target of a symbolic link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

/// One independently verifiable chunk of a regular file.
///
/// Offsets are in uncompressed file coordinates. The digest is kept as the raw
/// manifest string so that a malformed value surfaces as a verification failure
/// at read time rather than as a metadata error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// Offset of the chunk within the file.
    pub offset: u64,
    /// Size of the chunk in bytes.
    pub size: u64,
    /// Chunk digest as recorded in the table of contents.
    pub digest: String,
}

impl ChunkEntry {
    /// Create a chunk entry.
    pub fn new(offset: u64, size: u64, digest: impl Into<String>) -> Self {
        Self {
            offset,
            size,
            digest: digest.into(),
        }
    }

    /// Offset one past the last byte of the chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Check if `offset` falls within this chunk.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// A directory child as reported by [`crate::MetadataReader::foreach_child`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    /// Name within the parent directory.
    pub name: String,
    /// Entry ID.
    pub id: EntryId,
    /// Entry type.
    pub kind: EntryKind,
    /// True for the table-of-contents pseudo-entry, which is metadata rather
    /// than layer content.
    pub is_toc: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_bounds() {
        let chunk: ChunkEntry = ChunkEntry::new(4, 4, "sha256:00");
        assert_eq!(chunk.end(), 8);
        assert!(!chunk.contains(3));
        assert!(chunk.contains(4));
        assert!(chunk.contains(7));
        assert!(!chunk.contains(8));
    }

    #[test]
    fn test_entry_kind_serde() {
        let json: String = serde_json::to_string(&EntryKind::Directory).unwrap();
        assert_eq!(json, "\"directory\"");
        assert!(EntryKind::Regular.is_regular());
        assert!(!EntryKind::Symlink.is_dir());
    }
}
