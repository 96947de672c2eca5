//! C3 — BlockLinkGraph: for each guest destination RIP, the host jump sites
//! that must be un-linked if that destination is invalidated.
//!
//! Grounded on the symbol/reverse-table pairing in
//! `raya-engine/src/aot/linker.rs` (`AotLinker`), generalized here to a
//! destination-keyed multimap with per-link delinker closures, matching
//! `Core.cpp`'s `AddBlockLink` / invalidation delinker loop.

use dbt_sdk::GuestRip;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// A host address that jumps directly to a guest destination's compiled
/// code, bypassing the lookup cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostLinkSite(pub usize);

/// Reverts one direct link back to an indirect (lookup-cache-mediated)
/// jump. Must be idempotent and must not acquire the invalidation lock --
/// it always runs while that lock is already held exclusively.
pub type Delinker = Box<dyn Fn() + Send + Sync>;

/// Global map from guest destination to the links that target it.
pub struct BlockLinkGraph {
    links: Mutex<BTreeMap<(GuestRip, HostLinkSite), Delinker>>,
}

impl BlockLinkGraph {
    /// Construct an empty graph.
    pub fn new() -> Self {
        BlockLinkGraph { links: Mutex::new(BTreeMap::new()) }
    }

    /// Record that `site` resolves directly to `dest` and must be delinked
    /// via `delinker` if `dest` is invalidated.
    pub fn add_block_link(&self, dest: GuestRip, site: HostLinkSite, delinker: Delinker) {
        self.links.lock().insert((dest, site), delinker);
    }

    /// Invoke and remove every delinker targeting `dest`, returning how many
    /// were processed.
    pub fn invalidate_destination(&self, dest: GuestRip) -> usize {
        let mut links = self.links.lock();
        let keys: Vec<_> = links
            .range((dest, HostLinkSite(0))..=(dest, HostLinkSite(usize::MAX)))
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            if let Some(delinker) = links.remove(key) {
                delinker();
            }
        }
        keys.len()
    }

    /// Number of links currently tracked, across all destinations.
    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    /// Whether no links are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BlockLinkGraph {
    fn default() -> Self {
        Self::new()
    }
}
