//! Per-component error enums, composed into one top-level [`CoreError`].
//!
//! Mirrors the convention, seen throughout `raya-engine`, of one `thiserror`
//! enum per subsystem (`CodegenError`, `JitError`, `VmError`, `LinkerError`)
//! composed via `#[from]` rather than a single flat error type.

use dbt_sdk::GuestRip;

/// Failures from the decode -> IR -> pass pipeline (C4).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The decoder failed before translating a single instruction.
    #[error("decode failed at {0:?} with no instructions translated")]
    EmptyBlock(GuestRip),
    /// The collaborator backend reported a fatal codegen error.
    #[error("backend codegen failed: {0}")]
    Backend(String),
}

/// Failures applying relocations to materialize cached or freshly emitted
/// code (C8).
#[derive(Debug, thiserror::Error)]
pub enum RelocationError {
    /// A `GuestRipMove`/`GuestRipLiteral` relocation referenced a guest RIP
    /// that is no longer valid (sentinel `!0`).
    #[error("relocation referenced an invalid guest RIP at offset {0}")]
    InvalidGuestRip(u32),
    /// A named thunk could not be resolved by the thunk handler.
    #[error("unresolved thunk symbol {0:#x}")]
    UnresolvedThunk(u64),
}

/// Failures from the on-disk/in-memory object cache (C7).
#[derive(Debug, thiserror::Error)]
pub enum ObjectCacheError {
    /// I/O failure reading or writing the cache file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The cache file's magic, version, or checksum did not validate; the
    /// caller should treat this the same as a cache miss, never a hard
    /// error.
    #[error("object cache file failed validation: {0}")]
    Corrupt(String),
}

/// Failures from thread lifecycle management (C9).
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// An entrypoint RIP violated the 32-bit-mode address width invariant.
    #[error("entrypoint {0:?} exceeds 32 bits while in 32-bit guest mode")]
    AddressWidthViolation(GuestRip),
    /// Attempted to operate on a thread not tracked by this context.
    #[error("unknown thread id {0}")]
    UnknownThread(u64),
}

/// Top-level error type returned from the engine's public API.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// See [`PipelineError`].
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    /// See [`RelocationError`].
    #[error(transparent)]
    Relocation(#[from] RelocationError),
    /// See [`ObjectCacheError`].
    #[error(transparent)]
    ObjectCache(#[from] ObjectCacheError),
    /// See [`SupervisorError`].
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    /// A collaborator reported a generic SDK-level error.
    #[error(transparent)]
    Sdk(#[from] dbt_sdk::SdkError),
}

/// Result alias used throughout the engine's public API.
pub type CoreResult<T> = Result<T, CoreError>;
