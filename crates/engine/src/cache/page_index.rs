//! C2 — CodePageIndex: guest page -> set of block-entry addresses whose
//! code touches that page. Drives self-modifying-code write-trap
//! notifications and is consulted by the invalidation engine to find every
//! block that might overlap an invalidated range.
//!
//! Grounded on `Core.cpp`'s `AddBlockExecutableRange` / the page-bucketed
//! iteration in `InvalidateGuestCodeRangeUnsafe`.

use dbt_sdk::GuestRip;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

/// Global index from guest page number to the block-entry addresses that
/// touch it.
pub struct CodePageIndex {
    pages: Mutex<BTreeMap<u64, BTreeSet<GuestRip>>>,
}

impl CodePageIndex {
    /// Construct an empty index.
    pub fn new() -> Self {
        CodePageIndex { pages: Mutex::new(BTreeMap::new()) }
    }

    /// Record that the block entered at `block_entry` covers
    /// `[start, start+length)`, appending it to every overlapped page's set.
    ///
    /// Returns whether any of those pages were previously untouched, which
    /// the caller uses to decide whether to notify the syscall handler that
    /// a new page needs write-trapping.
    pub fn add_block_executable_range(&self, block_entry: GuestRip, start: u64, length: u64) -> bool {
        if length == 0 {
            return false;
        }
        let first_page = start >> 12;
        let last_page = (start + length - 1) >> 12;
        let mut pages = self.pages.lock();
        let mut any_new = false;
        for page in first_page..=last_page {
            let set = pages.entry(page).or_insert_with(BTreeSet::new);
            if set.is_empty() {
                any_new = true;
            }
            set.insert(block_entry);
        }
        any_new
    }

    /// All block-entry addresses recorded on any page overlapping
    /// `[start, start+length)`, deduplicated.
    pub fn entries_in_range(&self, start: u64, length: u64) -> Vec<GuestRip> {
        if length == 0 {
            return Vec::new();
        }
        let first_page = start >> 12;
        let last_page = (start + length - 1) >> 12;
        let pages = self.pages.lock();
        let mut out: BTreeSet<GuestRip> = BTreeSet::new();
        for page in first_page..=last_page {
            if let Some(set) = pages.get(&page) {
                out.extend(set.iter().copied());
            }
        }
        out.into_iter().collect()
    }

    /// Clear every page's entry list overlapping `[start, start+length)`,
    /// called once all affected blocks have been evicted elsewhere.
    pub fn clear_range(&self, start: u64, length: u64) {
        if length == 0 {
            return;
        }
        let first_page = start >> 12;
        let last_page = (start + length - 1) >> 12;
        let mut pages = self.pages.lock();
        for page in first_page..=last_page {
            pages.remove(&page);
        }
    }

    /// Number of distinct pages currently tracked.
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }
}

impl Default for CodePageIndex {
    fn default() -> Self {
        Self::new()
    }
}
