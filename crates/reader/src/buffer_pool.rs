//! Reusable scratch buffers for chunk fetches.
//!
//! Buffers are grouped into power-of-two tiers. A request is served from the
//! smallest tier that fits it, and the buffer returns to that tier's free list
//! when the [`PooledBuffer`] is dropped. Each free list is capped so a burst of
//! large reads does not pin memory forever.
//!
//! ```text
//! request 5000 bytes ──► tier 8192 ──► pop free list or allocate
//!                                          │
//! PooledBuffer dropped ◄───────────────────┘ push back (if below cap)
//! ```

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::options::BufferPoolConfig;

/// Statistics about buffer pool usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Buffers freshly allocated.
    pub allocations: u64,
    /// Requests served from a free list.
    pub reuses: u64,
    /// Buffers currently sitting in free lists.
    pub free_buffers: usize,
}

/// Pool of scratch buffers keyed by size tier.
#[derive(Debug)]
pub struct BufferPool {
    config: BufferPoolConfig,
    free: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    allocations: AtomicU64,
    reuses: AtomicU64,
}

impl BufferPool {
    /// Create a new buffer pool.
    ///
    /// # Arguments
    /// * `config` - Pool configuration
    pub fn new(config: BufferPoolConfig) -> Self {
        Self {
            config,
            free: Mutex::new(HashMap::new()),
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
        }
    }

    /// Get a zeroed buffer of exactly `len` bytes.
    ///
    /// The buffer is exclusively owned until dropped.
    pub fn acquire(&self, len: usize) -> PooledBuffer<'_> {
        let tier: usize = self.tier_for(len);
        let recycled: Option<Vec<u8>> = self.free.lock().get_mut(&tier).and_then(|list| list.pop());

        let mut buf: Vec<u8> = match recycled {
            Some(buf) => {
                self.reuses.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(tier)
            }
        };
        buf.clear();
        buf.resize(len, 0);

        PooledBuffer {
            pool: self,
            tier,
            buf,
        }
    }

    /// Get pool statistics.
    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            free_buffers: self.free.lock().values().map(Vec::len).sum(),
        }
    }

    fn tier_for(&self, len: usize) -> usize {
        len.max(self.config.min_tier_size).next_power_of_two()
    }

    fn release(&self, tier: usize, buf: Vec<u8>) {
        let mut free = self.free.lock();
        let list: &mut Vec<Vec<u8>> = free.entry(tier).or_default();
        if list.len() < self.config.max_buffers_per_tier {
            list.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BufferPoolConfig::default())
    }
}

/// A buffer borrowed from a [`BufferPool`], returned on drop.
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    tier: usize,
    buf: Vec<u8>,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        let buf: Vec<u8> = std::mem::take(&mut self.buf);
        self.pool.release(self.tier, buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_length_and_zeroed() {
        let pool = BufferPool::default();
        let mut buf = pool.acquire(5000);
        assert_eq!(buf.len(), 5000);
        assert!(buf.iter().all(|&b| b == 0));
        buf[0] = 0xAB;
        drop(buf);

        // A recycled buffer comes back zeroed.
        let buf = pool.acquire(4097);
        assert_eq!(buf.len(), 4097);
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn test_reuse_within_tier() {
        let pool = BufferPool::default();

        drop(pool.acquire(5000));
        drop(pool.acquire(8192));
        // Different tier, new allocation.
        drop(pool.acquire(100));

        let stats: BufferPoolStats = pool.stats();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.reuses, 1);
        assert_eq!(stats.free_buffers, 2);
    }

    #[test]
    fn test_free_list_is_capped() {
        let pool = BufferPool::new(BufferPoolConfig::default().with_max_buffers_per_tier(2));

        let held: Vec<PooledBuffer<'_>> = (0..5).map(|_| pool.acquire(64)).collect();
        drop(held);

        assert_eq!(pool.stats().free_buffers, 2);
        assert_eq!(pool.stats().allocations, 5);
    }

    #[test]
    fn test_concurrent_use() {
        let pool = BufferPool::default();
        std::thread::scope(|scope| {
            for i in 0..8u8 {
                let pool: &BufferPool = &pool;
                scope.spawn(move || {
                    for _ in 0..100 {
                        let mut buf = pool.acquire(1024);
                        buf.fill(i);
                        assert!(buf.iter().all(|&b| b == i));
                    }
                });
            }
        });
        assert!(pool.stats().free_buffers <= crate::options::DEFAULT_MAX_BUFFERS_PER_TIER);
    }
}
