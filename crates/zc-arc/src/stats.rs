//! Cache counters and the serializable snapshot.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic event counters, updated without the list lock.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub mru_hits: AtomicU64,
    pub mfu_hits: AtomicU64,
    pub misses: AtomicU64,
    pub mru_ghost_hits: AtomicU64,
    pub mfu_ghost_hits: AtomicU64,
    pub coalesced_reads: AtomicU64,
    pub mru_evictions: AtomicU64,
    pub mfu_evictions: AtomicU64,
    pub evicted_bytes: AtomicU64,
    pub ghost_trims: AtomicU64,
    pub inserts: AtomicU64,
    pub fills: AtomicU64,
    pub uncached_fills: AtomicU64,
    pub admission_failures: AtomicU64,
    pub pressure_events: AtomicU64,
    pub io_errors: AtomicU64,
    pub config_over_limit: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time cache statistics.
///
/// Counters are cumulative since construction; the remaining fields are
/// gauges read under the list lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArcStats {
    pub hits: u64,
    pub mru_hits: u64,
    pub mfu_hits: u64,
    pub misses: u64,
    pub mru_ghost_hits: u64,
    pub mfu_ghost_hits: u64,
    /// Misses that joined a read already in flight.
    pub coalesced_reads: u64,
    pub mru_evictions: u64,
    pub mfu_evictions: u64,
    pub evicted_bytes: u64,
    /// Ghost entries dropped to keep the ghost lists bounded.
    pub ghost_trims: u64,
    pub inserts: u64,
    /// Device reads installed into the cache.
    pub fills: u64,
    /// Device reads handed to callers without being cached.
    pub uncached_fills: u64,
    pub admission_failures: u64,
    pub pressure_events: u64,
    pub io_errors: u64,
    /// Configuration adoptions that left resident bytes above the new
    /// `c_max` because the excess was pinned or dirty.
    pub config_over_limit: u64,

    pub mru_bytes: u64,
    pub mfu_bytes: u64,
    pub mru_ghost_bytes: u64,
    pub mfu_ghost_bytes: u64,
    pub mru_len: usize,
    pub mfu_len: usize,
    pub mru_ghost_len: usize,
    pub mfu_ghost_len: usize,
    pub dirty_bytes: u64,
    pub p: u64,
    pub c: u64,
    pub c_min: u64,
    pub c_max: u64,
    pub inflight_reads: usize,
    pub config_version: u64,
    pub halted: bool,
}

impl ArcStats {
    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.mru_bytes + self.mfu_bytes
    }

    #[must_use]
    pub fn resident_len(&self) -> usize {
        self.mru_len + self.mfu_len
    }

    /// Hit rate as a percentage (0.0 to 100.0). Returns 0.0 when no accesses.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate_pct(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        (self.hits as f64 / total as f64) * 100.0
    }

    pub(crate) fn fill_counters(&mut self, c: &Counters) {
        self.mru_hits = Counters::get(&c.mru_hits);
        self.mfu_hits = Counters::get(&c.mfu_hits);
        self.hits = self.mru_hits + self.mfu_hits;
        self.misses = Counters::get(&c.misses);
        self.mru_ghost_hits = Counters::get(&c.mru_ghost_hits);
        self.mfu_ghost_hits = Counters::get(&c.mfu_ghost_hits);
        self.coalesced_reads = Counters::get(&c.coalesced_reads);
        self.mru_evictions = Counters::get(&c.mru_evictions);
        self.mfu_evictions = Counters::get(&c.mfu_evictions);
        self.evicted_bytes = Counters::get(&c.evicted_bytes);
        self.ghost_trims = Counters::get(&c.ghost_trims);
        self.inserts = Counters::get(&c.inserts);
        self.fills = Counters::get(&c.fills);
        self.uncached_fills = Counters::get(&c.uncached_fills);
        self.admission_failures = Counters::get(&c.admission_failures);
        self.pressure_events = Counters::get(&c.pressure_events);
        self.io_errors = Counters::get(&c.io_errors);
        self.config_over_limit = Counters::get(&c.config_over_limit);
    }
}
