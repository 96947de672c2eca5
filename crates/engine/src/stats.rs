//! Per-thread runtime statistics exposed via the introspection API
//! (`GetRuntimeStatsForThread`).

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters accumulated over a thread's lifetime.
#[derive(Default)]
pub struct ThreadStats {
    blocks_compiled: AtomicU64,
    instructions_translated: AtomicU64,
    cache_clears: AtomicU64,
    object_cache_hits: AtomicU64,
    object_cache_misses: AtomicU64,
}

/// Point-in-time snapshot of a thread's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStatsSnapshot {
    /// Number of blocks fully compiled (not served from any cache).
    pub blocks_compiled: u64,
    /// Number of guest instructions translated across all compiles.
    pub instructions_translated: u64,
    /// Number of times this thread's code buffer was cleared wholesale.
    pub cache_clears: u64,
    /// Number of object-cache lookups that hit.
    pub object_cache_hits: u64,
    /// Number of object-cache lookups that missed.
    pub object_cache_misses: u64,
}

impl ThreadStats {
    /// Record a full compile of `instruction_count` instructions.
    pub fn record_block_compiled(&self, instruction_count: u64) {
        self.blocks_compiled.fetch_add(1, Ordering::Relaxed);
        self.instructions_translated.fetch_add(instruction_count, Ordering::Relaxed);
    }

    /// Record a wholesale cache clear.
    pub fn record_cache_clear(&self) {
        self.cache_clears.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an object-cache lookup outcome.
    pub fn record_object_cache_lookup(&self, hit: bool) {
        if hit {
            self.object_cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.object_cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot the current counter values.
    pub fn snapshot(&self) -> ThreadStatsSnapshot {
        ThreadStatsSnapshot {
            blocks_compiled: self.blocks_compiled.load(Ordering::Relaxed),
            instructions_translated: self.instructions_translated.load(Ordering::Relaxed),
            cache_clears: self.cache_clears.load(Ordering::Relaxed),
            object_cache_hits: self.object_cache_hits.load(Ordering::Relaxed),
            object_cache_misses: self.object_cache_misses.load(Ordering::Relaxed),
        }
    }
}
