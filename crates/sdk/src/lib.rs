//! Collaborator traits and wire types shared between the translation core
//! and the decoder/backend/runtime services it drives.
//!
//! This crate provides the minimal types and traits needed to plug a real
//! instruction decoder, IR pipeline, and code generator into `dbt-engine`
//! without that engine depending on any particular one of them.

#![warn(missing_docs)]

pub mod collaborators;
pub mod error;
pub mod relocation;
pub mod types;

pub use collaborators::{
    BlockCallback, CodegenBackend, CompiledCode, DebugServer, DecodedBlockRange, DecodedInstruction,
    DispatchBuilder, DispatchOutcome, FrontendDecoder, IrTextCodec, PassManager, PauseDelivery,
    SymbolRegistrar, SyscallHandler, ThunkHandler,
};
pub use error::SdkError;
pub use relocation::{NamedSymbol, Relocation};
pub use types::{
    Config, CoreMode, CpuState, DumpIr, ExitReason, GuestRip, HostCodePtr, ObjectCacheMode,
    RunningMode, SignalReason, SmcChecks,
};
