//! C8 — RelocationEngine: on cache hit, copy cached bytes into the live
//! code buffer and patch embedded literals/moves for the current process.
//!
//! Grounded on
//! `examples/original_source/.../Core/JIT/Arm64/Arm64Relocations.cpp`'s
//! `RelocateJITObjectCode`/`ApplyRelocations`: allocate, memcpy, patch each
//! relocation at `cursor + offset`, restore the cursor, flush I/D caches.
//!
//! This engine has no real assembler, so `NamedThunkMove`/`GuestRipMove` --
//! which the original re-emits as a fresh `LoadConstant` instruction -- are
//! modeled the same way as the two literal kinds: an 8-byte little-endian
//! patch at the relocation's offset. A real backend's emitted load
//! instruction would read that patched location rather than encode an
//! immediate inline, which is an implementation detail the relocation
//! engine doesn't need to know about.

use crate::error::RelocationError;
use dbt_sdk::{GuestRip, NamedSymbol, Relocation, ThunkHandler};

/// Sentinel the original uses for "no such guest RIP"; a
/// `GuestRipMove`/`GuestRipLiteral` relocation resolving to this value means
/// the destination is no longer valid.
const INVALID_GUEST_RIP: u64 = u64::MAX;

/// Resolves the current-process address of a named symbol.
pub trait NamedSymbolResolver: Send + Sync {
    /// Look up `symbol`'s current pointer value.
    fn resolve(&self, symbol: NamedSymbol) -> u64;
}

/// Applies relocations against a copy of previously emitted (or cached)
/// code bytes.
pub struct RelocationEngine<'a> {
    symbols: &'a dyn NamedSymbolResolver,
    thunks: &'a dyn ThunkHandler,
}

impl<'a> RelocationEngine<'a> {
    /// Construct an engine bound to the collaborators it needs to resolve
    /// symbols against.
    pub fn new(symbols: &'a dyn NamedSymbolResolver, thunks: &'a dyn ThunkHandler) -> Self {
        RelocationEngine { symbols, thunks }
    }

    /// Apply every relocation in `relocations` to a copy of `code`, patching
    /// literal/move sites relative to the block's guest entry point
    /// `guest_entry`. Returns the patched bytes, or an error if a relocation
    /// can't be resolved -- the caller (C5) falls back to a full compile in
    /// that case.
    pub fn materialize(
        &self,
        guest_entry: GuestRip,
        code: &[u8],
        relocations: &[Relocation],
    ) -> Result<Vec<u8>, RelocationError> {
        let mut bytes = code.to_vec();

        for reloc in relocations {
            let value = match reloc {
                Relocation::NamedSymbolLiteral { symbol, .. } => self.symbols.resolve(*symbol),
                Relocation::GuestRipLiteral { guest_entry_offset, .. }
                | Relocation::GuestRipMove { guest_entry_offset, .. } => {
                    let resolved = (guest_entry.0 as i64).wrapping_add(*guest_entry_offset) as u64;
                    if resolved == INVALID_GUEST_RIP {
                        return Err(RelocationError::InvalidGuestRip(reloc.offset()));
                    }
                    resolved
                }
                Relocation::NamedThunkMove { symbol, .. } => self
                    .thunks
                    .lookup_thunk(*symbol)
                    .ok_or(RelocationError::UnresolvedThunk(*symbol))? as u64,
            };

            patch_u64(&mut bytes, reloc.offset() as usize, value)?;
        }

        Ok(bytes)
    }
}

fn patch_u64(bytes: &mut [u8], offset: usize, value: u64) -> Result<(), RelocationError> {
    let end = offset
        .checked_add(8)
        .ok_or(RelocationError::InvalidGuestRip(offset as u32))?;
    if end > bytes.len() {
        return Err(RelocationError::InvalidGuestRip(offset as u32));
    }
    bytes[offset..end].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSymbolResolver(u64);
    impl NamedSymbolResolver for FixedSymbolResolver {
        fn resolve(&self, _symbol: NamedSymbol) -> u64 {
            self.0
        }
    }

    struct FixedThunkHandler(Option<usize>);
    impl ThunkHandler for FixedThunkHandler {
        fn lookup_thunk(&self, _symbol: u64) -> Option<usize> {
            self.0
        }
    }

    #[test]
    fn named_symbol_literal_patches_exit_linker_address() {
        let resolver = FixedSymbolResolver(0x7f0000001000);
        let thunks = FixedThunkHandler(None);
        let engine = RelocationEngine::new(&resolver, &thunks);
        let code = vec![0u8; 16];
        let relocs = vec![Relocation::NamedSymbolLiteral { offset: 4, symbol: NamedSymbol::ExitFunctionLinker }];
        let out = engine.materialize(GuestRip(0x400000), &code, &relocs).unwrap();
        assert_eq!(u64::from_le_bytes(out[4..12].try_into().unwrap()), 0x7f0000001000);
    }

    #[test]
    fn guest_rip_literal_applies_offset_from_entry() {
        let resolver = FixedSymbolResolver(0);
        let thunks = FixedThunkHandler(None);
        let engine = RelocationEngine::new(&resolver, &thunks);
        let code = vec![0u8; 16];
        let relocs = vec![Relocation::GuestRipLiteral { offset: 0, guest_entry_offset: 0x10 }];
        let out = engine.materialize(GuestRip(0x400000), &code, &relocs).unwrap();
        assert_eq!(u64::from_le_bytes(out[0..8].try_into().unwrap()), 0x400010);
    }

    #[test]
    fn unresolved_thunk_fails_materialization() {
        let resolver = FixedSymbolResolver(0);
        let thunks = FixedThunkHandler(None);
        let engine = RelocationEngine::new(&resolver, &thunks);
        let code = vec![0u8; 16];
        let relocs = vec![Relocation::NamedThunkMove { offset: 0, symbol: 0xabc, register: 3 }];
        let err = engine.materialize(GuestRip(0x400000), &code, &relocs).unwrap_err();
        assert!(matches!(err, RelocationError::UnresolvedThunk(0xabc)));
    }

    #[test]
    fn offset_out_of_bounds_is_rejected() {
        let resolver = FixedSymbolResolver(0);
        let thunks = FixedThunkHandler(None);
        let engine = RelocationEngine::new(&resolver, &thunks);
        let code = vec![0u8; 4];
        let relocs = vec![Relocation::GuestRipLiteral { offset: 0, guest_entry_offset: 0 }];
        assert!(engine.materialize(GuestRip(0x400000), &code, &relocs).is_err());
    }
}
