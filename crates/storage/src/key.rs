//! Content-derived chunk cache keys.

use std::fmt;

use sha2::{Digest, Sha256};

/// Cache key for one chunk of one file.
///
/// Derived from `(file_id, chunk_offset, chunk_size)` as the hex SHA-256 of
/// `"{file_id}-{chunk_offset}-{chunk_size}"`, so identical triples always map
/// to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey(String);

impl ChunkKey {
    /// Derive the key for a chunk.
    ///
    /// # Arguments
    /// * `file_id` - Entry ID of the file within its layer
    /// * `chunk_offset` - Offset of the chunk within the file
    /// * `chunk_size` - Size of the chunk in bytes
    pub fn new(file_id: u32, chunk_offset: u64, chunk_size: u64) -> Self {
        let material: String = format!("{}-{}-{}", file_id, chunk_offset, chunk_size);
        ChunkKey(hex::encode(Sha256::digest(material.as_bytes())))
    }

    /// Wrap a key that was derived elsewhere (for example, read back from disk).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        ChunkKey(hex.into())
    }

    /// Get the key as a hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character shard prefix used by on-disk layouts.
    pub fn shard(&self) -> &str {
        self.0.get(..2).unwrap_or(&self.0)
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChunkKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_key_is_deterministic() {
        assert_eq!(ChunkKey::new(7, 4096, 4096), ChunkKey::new(7, 4096, 4096));
        assert_eq!(ChunkKey::new(7, 4096, 4096).as_str().len(), 64);
    }

    #[test]
    fn test_known_value() {
        // sha256("1-0-4")
        let key: ChunkKey = ChunkKey::new(1, 0, 4);
        let expected: String = hex::encode(Sha256::digest(b"1-0-4"));
        assert_eq!(key.as_str(), expected);
        assert_eq!(key.shard(), &expected[..2]);
    }

    #[test]
    fn test_distinct_triples_distinct_keys() {
        let mut keys: HashSet<ChunkKey> = HashSet::new();
        for id in 0..8u32 {
            for offset in [0u64, 4, 8] {
                for size in [1u64, 4] {
                    keys.insert(ChunkKey::new(id, offset, size));
                }
            }
        }
        assert_eq!(keys.len(), 8 * 3 * 2);

        // Separator prevents "1-23-4" colliding with "12-3-4".
        assert_ne!(ChunkKey::new(1, 23, 4), ChunkKey::new(12, 3, 4));
    }
}
