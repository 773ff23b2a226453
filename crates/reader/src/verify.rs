//! Chunk verification and the reader's trust state.
//!
//! A reader starts unverified. Until [`VerifyState::enforce`] is called,
//! chunk verification failures are recorded and tolerated so the cache can
//! warm speculatively. Enforcement is one-way; once set, every failure is
//! fatal, and any failure recorded earlier is handed to the enforcer.
//!
//! The soft path stores its error while holding the enforcement read lock,
//! and enforcement flips the flag and loads the stored error under the write
//! lock. A failure therefore either lands before enforcement (and is seen by
//! it) or after (and is returned to the reader as fatal). None slip through.

use std::sync::atomic::{AtomicBool, Ordering};

use lazylayer_model::{ChunkEntry, Digest, DigestVerifier, EntryId};
use parking_lot::{Mutex, RwLock};

use crate::error::{ReaderError, VerifyError};

/// Check `data` against the digest recorded for `chunk`.
///
/// # Arguments
/// * `file_id` - Entry ID the chunk belongs to
/// * `chunk` - Chunk descriptor from the chunk map
/// * `data` - The whole chunk as fetched
pub fn verify_chunk(file_id: EntryId, chunk: &ChunkEntry, data: &[u8]) -> Result<(), VerifyError> {
    let expected: Digest = Digest::parse(&chunk.digest).map_err(|_| VerifyError::InvalidDigest {
        file_id,
        offset: chunk.offset,
        digest: chunk.digest.clone(),
    })?;

    let mut verifier: DigestVerifier = expected.verifier();
    verifier.update(data);
    let actual: Digest = verifier.finalize();

    if actual != expected {
        return Err(VerifyError::DigestMismatch {
            file_id,
            offset: chunk.offset,
            size: chunk.size,
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Outcome of checking one fetched chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkTrust {
    /// Digest matched; safe to cache.
    Verified,
    /// Digest did not match but the failure was tolerated; serve, do not cache.
    Tolerated,
}

/// One-way flags shared by every handle on a reader.
#[derive(Debug, Default)]
pub(crate) struct VerifyState {
    closed: Mutex<bool>,
    last_verify_error: Mutex<Option<VerifyError>>,
    prohibit_verify_failure: RwLock<bool>,
    verified: AtomicBool,
}

impl VerifyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Mark closed. Returns false if already closed.
    pub fn mark_closed(&self) -> bool {
        let mut closed = self.closed.lock();
        if *closed {
            return false;
        }
        *closed = true;
        true
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::Acquire)
    }

    pub fn mark_verified(&self) {
        self.verified.store(true, Ordering::Release);
    }

    /// Make verification failures fatal from now on.
    ///
    /// Returns the failure recorded by an earlier speculative read, if any.
    pub fn enforce(&self) -> Option<VerifyError> {
        let mut prohibit = self.prohibit_verify_failure.write();
        *prohibit = true;
        self.last_verify_error.lock().clone()
    }

    pub fn last_verify_error(&self) -> Option<VerifyError> {
        self.last_verify_error.lock().clone()
    }

    /// Verify a fetched chunk under the current trust policy.
    pub fn check(
        &self,
        file_id: EntryId,
        chunk: &ChunkEntry,
        data: &[u8],
    ) -> Result<ChunkTrust, ReaderError> {
        let err: VerifyError = match verify_chunk(file_id, chunk, data) {
            Ok(()) => return Ok(ChunkTrust::Verified),
            Err(e) => e,
        };

        if self.is_verified() {
            tracing::warn!(
                file_id,
                offset = chunk.offset,
                size = chunk.size,
                "Chunk failed verification: {}",
                err
            );
            return Err(ReaderError::ContentCorruption(err));
        }

        let prohibit = self.prohibit_verify_failure.read();
        if *prohibit {
            tracing::warn!(
                file_id,
                offset = chunk.offset,
                size = chunk.size,
                "Chunk failed verification: {}",
                err
            );
            return Err(ReaderError::ContentCorruption(err));
        }

        tracing::warn!(
            file_id,
            offset = chunk.offset,
            size = chunk.size,
            "Speculative chunk failed verification, recording: {}",
            err
        );
        *self.last_verify_error.lock() = Some(err);
        drop(prohibit);
        Ok(ChunkTrust::Tolerated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_for(data: &[u8]) -> ChunkEntry {
        ChunkEntry::new(0, data.len() as u64, Digest::sha256(data).to_string())
    }

    #[test]
    fn test_verify_chunk() {
        let chunk: ChunkEntry = chunk_for(b"ABCD");
        assert!(verify_chunk(1, &chunk, b"ABCD").is_ok());
        assert!(matches!(
            verify_chunk(1, &chunk, b"ABCX"),
            Err(VerifyError::DigestMismatch { file_id: 1, .. })
        ));

        let bad = ChunkEntry::new(0, 4, "md5:abc");
        assert!(matches!(
            verify_chunk(1, &bad, b"ABCD"),
            Err(VerifyError::InvalidDigest { .. })
        ));
    }

    #[test]
    fn test_soft_failure_before_enforcement() {
        let state = VerifyState::new();
        let chunk: ChunkEntry = chunk_for(b"ABCD");

        assert_eq!(state.check(1, &chunk, b"ABCD").unwrap(), ChunkTrust::Verified);
        assert_eq!(state.check(1, &chunk, b"XXXX").unwrap(), ChunkTrust::Tolerated);
        assert!(state.last_verify_error().is_some());

        // Enforcement surfaces the recorded failure.
        assert!(state.enforce().is_some());
    }

    #[test]
    fn test_hard_failure_after_enforcement() {
        let state = VerifyState::new();
        let chunk: ChunkEntry = chunk_for(b"ABCD");

        assert!(state.enforce().is_none());
        assert!(matches!(
            state.check(1, &chunk, b"XXXX"),
            Err(ReaderError::ContentCorruption(_))
        ));
    }

    #[test]
    fn test_hard_failure_when_verified() {
        let state = VerifyState::new();
        state.mark_verified();
        let chunk: ChunkEntry = chunk_for(b"ABCD");

        assert!(matches!(
            state.check(1, &chunk, b"XXXX"),
            Err(ReaderError::ContentCorruption(_))
        ));
        assert!(state.last_verify_error().is_none());
    }

    #[test]
    fn test_close_is_one_way() {
        let state = VerifyState::new();
        assert!(!state.is_closed());
        assert!(state.mark_closed());
        assert!(!state.mark_closed());
        assert!(state.is_closed());
    }
}
