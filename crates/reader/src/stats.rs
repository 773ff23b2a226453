//! Read path statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;

use crate::buffer_pool::BufferPoolStats;

/// Snapshot of reader statistics.
#[derive(Debug, Clone, Default)]
pub struct ReaderStats {
    /// Chunk reads served from the cache.
    pub cache_hits: u64,
    /// Chunk reads that missed the cache.
    pub cache_misses: u64,
    /// Chunks fetched from the transport by `read_at`.
    pub on_demand_fetches: u64,
    /// Bytes fetched from the transport by `read_at`.
    pub on_demand_bytes: u64,
    /// Chunks fetched by prefetch.
    pub prefetch_fetches: u64,
    /// Chunks prefetch found already cached.
    pub prefetch_skips: u64,
    /// Neighbour chunks cached through the pre-read hook.
    pub pre_read_cached: u64,
    /// Chunks that failed digest verification.
    pub verify_failures: u64,
    /// Best-effort cache writes that failed.
    pub cache_write_failures: u64,
    /// Chunks currently being fetched by `read_at`.
    pub in_flight_fetches: usize,
    /// Scratch buffer pool statistics.
    pub buffer_pool: BufferPoolStats,
    /// Time since the reader was created.
    pub uptime_secs: u64,
}

impl ReaderStats {
    /// Calculate the chunk cache hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total: u64 = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / total as f64) * 100.0
        }
    }
}

/// Live counters updated on the read path.
#[derive(Debug)]
pub(crate) struct StatsCollector {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub on_demand_fetches: AtomicU64,
    pub on_demand_bytes: AtomicU64,
    pub prefetch_fetches: AtomicU64,
    pub prefetch_skips: AtomicU64,
    pub pre_read_cached: AtomicU64,
    pub verify_failures: AtomicU64,
    pub cache_write_failures: AtomicU64,
    last_on_demand_read: Mutex<SystemTime>,
    start_time: Instant,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            on_demand_fetches: AtomicU64::new(0),
            on_demand_bytes: AtomicU64::new(0),
            prefetch_fetches: AtomicU64::new(0),
            prefetch_skips: AtomicU64::new(0),
            pre_read_cached: AtomicU64::new(0),
            verify_failures: AtomicU64::new(0),
            cache_write_failures: AtomicU64::new(0),
            last_on_demand_read: Mutex::new(SystemTime::now()),
            start_time: Instant::now(),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a chunk fetched for `read_at`.
    pub fn record_on_demand(&self, bytes: u64) {
        self.on_demand_fetches.fetch_add(1, Ordering::Relaxed);
        self.on_demand_bytes.fetch_add(bytes, Ordering::Relaxed);
        *self.last_on_demand_read.lock() = SystemTime::now();
    }

    pub fn last_on_demand_read(&self) -> SystemTime {
        *self.last_on_demand_read.lock()
    }

    /// Collect a snapshot.
    pub fn collect(&self, buffer_pool: BufferPoolStats, in_flight_fetches: usize) -> ReaderStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ReaderStats {
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            on_demand_fetches: load(&self.on_demand_fetches),
            on_demand_bytes: load(&self.on_demand_bytes),
            prefetch_fetches: load(&self.prefetch_fetches),
            prefetch_skips: load(&self.prefetch_skips),
            pre_read_cached: load(&self.pre_read_cached),
            verify_failures: load(&self.verify_failures),
            cache_write_failures: load(&self.cache_write_failures),
            in_flight_fetches,
            buffer_pool,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}
