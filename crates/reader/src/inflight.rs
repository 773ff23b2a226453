//! Per-chunk fetch gates.
//!
//! Concurrent `read_at` calls that miss the cache for the same chunk take the
//! chunk's gate in turn; the first fetches and caches, the rest find the
//! chunk in the cache once they get through.

use std::sync::Arc;

use dashmap::DashMap;
use lazylayer_storage::ChunkKey;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

/// Gates keyed by chunk, created on demand and dropped when unused.
#[derive(Debug, Default)]
pub(crate) struct FetchGates {
    gates: DashMap<ChunkKey, Arc<Mutex<()>>>,
}

impl FetchGates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the gate for `key` is free and take it.
    pub fn acquire(&self, key: &ChunkKey) -> FetchGuard<'_> {
        let gate: Arc<Mutex<()>> = self
            .gates
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        FetchGuard {
            gates: self,
            key: key.clone(),
            guard: Some(gate.lock_arc()),
        }
    }

    /// Number of gates currently allocated.
    pub fn len(&self) -> usize {
        self.gates.len()
    }
}

/// Holds a chunk's gate until dropped.
pub(crate) struct FetchGuard<'a> {
    gates: &'a FetchGates,
    key: ChunkKey,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody is waiting.
        self.gates
            .gates
            .remove_if(&self.key, |_, gate| Arc::strong_count(gate) == 1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_gate_serializes_same_key() {
        let gates = FetchGates::new();
        let key: ChunkKey = ChunkKey::new(1, 0, 4);
        let inside = AtomicUsize::new(0);
        let max_inside = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let _guard = gates.acquire(&key);
                    let now: usize = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(gates.len(), 0);
    }

    #[test]
    fn test_distinct_keys_do_not_block() {
        let gates = FetchGates::new();
        let a = gates.acquire(&ChunkKey::new(1, 0, 4));
        let b = gates.acquire(&ChunkKey::new(1, 4, 4));
        assert_eq!(gates.len(), 2);
        drop(a);
        drop(b);
        assert_eq!(gates.len(), 0);
    }
}
