//! CustomIRHandlers: entry addresses that bypass the decoder entirely and
//! are compiled from a hand-written IR-builder callback instead. Used to
//! inject instrumentation or emulation hooks at known guest addresses.
//!
//! Grounded on `Core.cpp`'s `CustomIRMutex`-guarded map and
//! `AddCustomIREntrypoint`/`RemoveCustomIREntrypoint`.

use dbt_sdk::GuestRip;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// A callback that builds IR for a custom entrypoint in place of normal
/// decode. Treated by the pipeline as a single-instruction block.
pub type CustomIrBuilder = Box<dyn Fn(GuestRip) + Send + Sync>;

/// Global registry of custom IR entrypoints.
pub struct CustomIrHandlers {
    handlers: RwLock<FxHashMap<GuestRip, CustomIrBuilder>>,
}

impl CustomIrHandlers {
    /// Construct an empty registry.
    pub fn new() -> Self {
        CustomIrHandlers { handlers: RwLock::new(FxHashMap::default()) }
    }

    /// Register `builder` at `rip`. Returns `false` if an entry already
    /// exists there, matching the embedding API's `AddCustomIREntrypoint`
    /// contract.
    pub fn add(&self, rip: GuestRip, builder: CustomIrBuilder) -> bool {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&rip) {
            return false;
        }
        handlers.insert(rip, builder);
        true
    }

    /// Remove the handler at `rip`, if any. Called from inside the
    /// invalidation engine's exclusive lock so removal is atomic with the
    /// matching cache eviction.
    pub fn remove(&self, rip: GuestRip) {
        self.handlers.write().remove(&rip);
    }

    /// Whether a custom handler is registered at `rip`.
    pub fn contains(&self, rip: GuestRip) -> bool {
        self.handlers.read().contains_key(&rip)
    }

    /// Invoke the handler registered at `rip`, if any.
    pub fn invoke(&self, rip: GuestRip) -> bool {
        let handlers = self.handlers.read();
        if let Some(builder) = handlers.get(&rip) {
            builder(rip);
            true
        } else {
            false
        }
    }
}

impl Default for CustomIrHandlers {
    fn default() -> Self {
        Self::new()
    }
}
