//! C1 — LookupCache: guest RIP -> host code pointer.
//!
//! Three tiers consulted in order: an L1 direct-mapped table (fast, small),
//! an L2 table keyed by guest page, and a catch-all overflow map. Grounded
//! on `raya-engine/src/jit/runtime/code_cache.rs`'s `RwLock<FxHashMap<..>>`
//! plus invalidation-flag pattern, generalized into a three-tier shape.
//!
//! A JIT-emitted caller would read L1/L2 directly out of a lock-free table
//! embedded in the thread's dispatcher frame. This engine is plain safe Rust
//! and is never itself the thing executing as JIT code, so `find_block`
//! instead takes a read lock over all three tiers; stale reads are tolerable
//! and torn reads never happen, because every mutation holds the same lock
//! exclusively.

use dbt_sdk::{GuestRip, HostCodePtr};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Number of direct-mapped L1 slots. Must be a power of two.
const L1_SLOTS: usize = 4096;

#[derive(Clone, Copy)]
struct L1Entry {
    rip: GuestRip,
    ptr: HostCodePtr,
    occupied: bool,
}

impl Default for L1Entry {
    fn default() -> Self {
        L1Entry { rip: GuestRip(0), ptr: HostCodePtr::NULL, occupied: false }
    }
}

struct Tables {
    l1: Vec<L1Entry>,
    l2: FxHashMap<u64, FxHashMap<u64, HostCodePtr>>,
    overflow: FxHashMap<GuestRip, HostCodePtr>,
}

impl Tables {
    fn new() -> Self {
        Tables {
            l1: vec![L1Entry::default(); L1_SLOTS],
            l2: FxHashMap::default(),
            overflow: FxHashMap::default(),
        }
    }

    fn l1_index(rip: GuestRip) -> usize {
        (rip.0 as usize) & (L1_SLOTS - 1)
    }
}

/// Per-thread guest-RIP -> host-code-pointer cache.
pub struct LookupCache {
    tables: RwLock<Tables>,
}

impl LookupCache {
    /// Construct an empty cache.
    pub fn new() -> Self {
        LookupCache { tables: RwLock::new(Tables::new()) }
    }

    /// Look up `rip`, consulting L1, then L2, then the overflow map.
    pub fn find_block(&self, rip: GuestRip) -> HostCodePtr {
        let tables = self.tables.read();
        let slot = &tables.l1[Tables::l1_index(rip)];
        if slot.occupied && slot.rip == rip {
            return slot.ptr;
        }
        if let Some(page) = tables.l2.get(&rip.page()) {
            if let Some(ptr) = page.get(&rip.0) {
                return *ptr;
            }
        }
        tables.overflow.get(&rip).copied().unwrap_or(HostCodePtr::NULL)
    }

    /// Install a mapping in all three tiers.
    pub fn add_block_mapping(&self, rip: GuestRip, ptr: HostCodePtr) {
        let mut tables = self.tables.write();
        let idx = Tables::l1_index(rip);
        // A prior occupant of this L1 slot, if any, keeps living only in
        // L2/overflow -- it is never evicted from those by an L1 collision.
        tables.l1[idx] = L1Entry { rip, ptr, occupied: true };
        tables.l2.entry(rip.page()).or_default().insert(rip.0, ptr);
        tables.overflow.insert(rip, ptr);
    }

    /// Remove `rip` from every tier.
    pub fn erase(&self, rip: GuestRip) {
        let mut tables = self.tables.write();
        let idx = Tables::l1_index(rip);
        if tables.l1[idx].occupied && tables.l1[idx].rip == rip {
            tables.l1[idx] = L1Entry::default();
        }
        if let Some(page) = tables.l2.get_mut(&rip.page()) {
            page.remove(&rip.0);
            if page.is_empty() {
                tables.l2.remove(&rip.page());
            }
        }
        tables.overflow.remove(&rip);
    }

    /// Whether `rip` currently resolves to a non-null pointer.
    pub fn contains(&self, rip: GuestRip) -> bool {
        !self.find_block(rip).is_null()
    }

    /// Reset every tier to empty, used when the owning code buffer is
    /// cleared wholesale.
    pub fn clear(&self) {
        *self.tables.write() = Tables::new();
    }

    /// Number of distinct entries tracked in the overflow map (used for
    /// stats; L1/L2 are redundant views of the same set).
    pub fn len(&self) -> usize {
        self.tables.read().overflow.len()
    }

    /// Whether the cache has no entries at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(n: usize) -> HostCodePtr {
        HostCodePtr::new(n, 1)
    }

    #[test]
    fn miss_returns_null() {
        let cache = LookupCache::new();
        assert!(cache.find_block(GuestRip(0x400000)).is_null());
    }

    #[test]
    fn add_then_find_returns_same_pointer() {
        let cache = LookupCache::new();
        cache.add_block_mapping(GuestRip(0x400000), ptr(0x1000));
        assert_eq!(cache.find_block(GuestRip(0x400000)), ptr(0x1000));
        assert!(cache.contains(GuestRip(0x400000)));
    }

    #[test]
    fn erase_removes_from_every_tier() {
        let cache = LookupCache::new();
        cache.add_block_mapping(GuestRip(0x401000), ptr(0x2000));
        cache.erase(GuestRip(0x401000));
        assert!(cache.find_block(GuestRip(0x401000)).is_null());
        assert!(!cache.contains(GuestRip(0x401000)));
    }

    #[test]
    fn l1_collision_keeps_old_entry_reachable_via_overflow() {
        let cache = LookupCache::new();
        let a = GuestRip(0x1000);
        let b = GuestRip(a.0 + (L1_SLOTS as u64));
        cache.add_block_mapping(a, ptr(1));
        cache.add_block_mapping(b, ptr(2));
        // a's L1 slot has been overwritten by b, but overflow still knows it.
        assert_eq!(cache.find_block(a), ptr(1));
        assert_eq!(cache.find_block(b), ptr(2));
    }

    #[test]
    fn clear_empties_every_tier() {
        let cache = LookupCache::new();
        cache.add_block_mapping(GuestRip(0x402000), ptr(3));
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.find_block(GuestRip(0x402000)).is_null());
    }
}
