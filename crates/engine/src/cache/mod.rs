//! Cache subsystems: the per-thread lookup cache (C1), the global code-page
//! index (C2), and the global block-link graph (C3).

pub mod block_links;
pub mod lookup;
pub mod page_index;

pub use block_links::{BlockLinkGraph, Delinker, HostLinkSite};
pub use lookup::LookupCache;
pub use page_index::CodePageIndex;
