//! `dbt-engine`: the core execution engine of a user-mode dynamic binary
//! translator.
//!
//! This crate owns the composite subsystem described in the top-level
//! design: the per-thread compilation pipeline (decode -> IR -> passes ->
//! backend emit -> cache insert), the lookup/code cache and its block-link
//! graph, the thread pause/run/step/stop state machine, and the optional
//! persistent object-code cache with its relocation engine. Everything this
//! crate does not itself implement -- the instruction decoder, the
//! opcode-to-IR dispatcher, the IR pass manager, the host backend, and the
//! syscall/thunk/symbol/pause-delivery services -- is a collaborator trait
//! from [`dbt_sdk`] that an embedder supplies.
//!
//! [`context::Context`] is the single entry point: an embedder constructs
//! one around its chosen collaborators, calls
//! [`Context::init_core`](context::Context::init_core) to create the parent
//! guest thread, and drives it with
//! [`Context::run_until_exit`](context::Context::run_until_exit).
//!
//! # Example
//!
//! ```rust,ignore
//! use dbt_engine::Context;
//! use dbt_sdk::{Config, GuestRip};
//!
//! let ctx = Context::new(
//!     Config::default(),
//!     backend, dispatcher, decoder, pass_manager,
//!     syscall_handler, symbols, thunks, pause_delivery,
//!     Box::new(|| MyDispatchBuilder::new()),
//! );
//! let thread = ctx.init_core(GuestRip(0x400000), stack_top);
//! let exit_reason = ctx.run_until_exit(&thread);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Cache subsystems: lookup cache (C1), code-page index (C2), and
/// block-link graph (C3).
pub mod cache;

/// Shared append-only executable code storage (the buffer [`cache`]
/// pointers and the backend's emitted bytes live in).
pub mod code_buffer;

/// [`context::Context`]: the top-level embedding-API object (§6).
pub mod context;

/// C5 — `CodeCacheCoordinator`: serves `CompileBlock(rip)`.
pub mod coordinator;

/// Custom IR entrypoints that bypass the decoder.
pub mod custom_ir;

/// C10 — the dispatcher trait boundary and its test double.
pub mod dispatcher;

/// Per-component error enums and the top-level [`error::CoreError`].
pub mod error;

/// C6 — `InvalidationEngine`: evicts cache entries and block links for an
/// invalidated guest address range.
pub mod invalidation;

/// C7 — `ObjectCacheService`: asynchronous, reference-counted persistence
/// of emitted code across process runs.
pub mod object_cache;

/// C4 — `CompilationPipeline`: decode -> IR build -> passes, for one guest
/// entry point.
pub mod pipeline;

/// C8 — `RelocationEngine`: patches embedded literals/moves in
/// materialized cached or freshly emitted code.
pub mod relocation;

/// Per-thread runtime statistics exposed via the introspection API.
pub mod stats;

/// C9 — `ThreadSupervisor`: the thread lifecycle state machine and its
/// quiescence primitive.
pub mod supervisor;

/// Per-thread state: CPU registers, lookup cache, debug store, pipeline.
pub mod thread_state;

pub use cache::{BlockLinkGraph, CodePageIndex, Delinker, HostLinkSite, LookupCache};
pub use code_buffer::CodeBuffer;
pub use context::{AotCacheEntry, Context, CustomExitHandler};
pub use coordinator::CodeCacheCoordinator;
pub use custom_ir::{CustomIrBuilder, CustomIrHandlers};
pub use dispatcher::{
    Dispatcher, DispatchStep, DispatcherConfig, GuestProgram, RuntimeHelperTable, ScriptedProgram,
    StubDispatcher,
};
pub use error::{CoreError, CoreResult, ObjectCacheError, PipelineError, RelocationError, SupervisorError};
pub use invalidation::InvalidationEngine;
pub use object_cache::{default_cache_path, CachedFragment, ObjectCacheService, SerializationJob};
pub use pipeline::{CompilationPipeline, GeneratedIr};
pub use relocation::{NamedSymbolResolver, RelocationEngine};
pub use stats::{ThreadStats, ThreadStatsSnapshot};
pub use supervisor::{IdleWaitGate, ThreadLifecycle, ThreadSupervisor};
#[cfg(unix)]
pub use supervisor::{reserve_pause_signal, PosixPauseDelivery};
pub use thread_state::{DebugData, ThreadId, ThreadState};
