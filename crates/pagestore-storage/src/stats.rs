//! Store counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Store statistics
#[derive(Debug, Default)]
pub struct StoreStats {
    /// Items handed to `store`
    pub writes: AtomicU64,
    /// Calls to `load`
    pub reads: AtomicU64,
    /// Loads that returned bytes
    pub hits: AtomicU64,
    /// Loads that found nothing
    pub misses: AtomicU64,
    /// Payload bytes written to backing files
    pub bytes_written: AtomicU64,
    /// Payload bytes read from backing files
    pub bytes_read: AtomicU64,
    /// Writes that failed to reach disk
    pub write_errors: AtomicU64,
    /// Reads that failed on I/O
    pub read_errors: AtomicU64,
    /// Sub-streams dropped to keep a session under budget
    pub evicted_sub_streams: AtomicU64,
    /// Queued writes performed by the background flusher
    pub deferred_writes_flushed: AtomicU64,
}

impl StoreStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            evicted_sub_streams: self.evicted_sub_streams.load(Ordering::Relaxed),
            deferred_writes_flushed: self.deferred_writes_flushed.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }

    pub(crate) fn record_hit(&self, bytes: usize) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Plain copy of [`StoreStats`] for reporting
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub writes: u64,
    pub reads: u64,
    pub hits: u64,
    pub misses: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub write_errors: u64,
    pub read_errors: u64,
    pub evicted_sub_streams: u64,
    pub deferred_writes_flushed: u64,
    pub hit_ratio: f64,
}
