//! C6 — InvalidationEngine: given a guest address range, evict affected
//! lookup-cache entries on every thread, tear down block links, and clear
//! the page index's record of the range.
//!
//! Grounded on `Core.cpp`'s `InvalidateGuestCodeRangeUnsafe`: the exclusive
//! `CodeInvalidationMutex` acquisition itself lives in `Context`, since it's
//! the same lock compilation takes shared; this module is the part that
//! runs once that lock is already held.

use crate::cache::{BlockLinkGraph, CodePageIndex};
use crate::thread_state::ThreadState;
use dbt_sdk::{CodegenBackend, DispatchBuilder, GuestRip};
use std::sync::Arc;

/// Stateless driver for one invalidation pass. Holds no data of its own;
/// all the structures it touches are owned by the `Context`.
pub struct InvalidationEngine;

impl InvalidationEngine {
    /// Evict every block entry recorded on any page overlapping
    /// `[start, start+length)` from every thread's lookup cache and debug
    /// store, invoke and remove the matching block links, and clear the
    /// page index's record of those pages.
    ///
    /// Returns the set of guest addresses evicted, so callers (e.g. an
    /// `after_hook` that also needs to remove a custom IR handler) can act
    /// on the exact set atomically with this pass.
    pub fn invalidate_range<D, C>(
        page_index: &CodePageIndex,
        block_links: &BlockLinkGraph,
        threads: &[Arc<ThreadState<D, C>>],
        start: u64,
        length: u64,
    ) -> Vec<GuestRip>
    where
        D: DispatchBuilder,
        C: CodegenBackend<Ir = D::Ir, RegisterAllocationData = D::RegisterAllocationData>,
    {
        let addrs = page_index.entries_in_range(start, length);

        for addr in &addrs {
            for thread in threads {
                thread.lookup_cache.erase(*addr);
                thread.erase_debug_data(*addr);
            }
            block_links.invalidate_destination(*addr);
        }

        page_index.clear_range(start, length);
        addrs
    }
}
