//! Trait boundaries for everything the engine treats as an external
//! collaborator: the instruction decoder, the opcode-to-IR dispatcher, the
//! IR pass manager, the host code backend, and the handful of runtime
//! services (syscalls, thunks, symbols, pause delivery) the core calls into
//! at well-defined hooks.
//!
//! None of these traits prescribe an instruction set, an IR, or a machine
//! code encoding; the engine only needs to know how to drive them and what
//! shape of answer to expect back.

use crate::error::SdkError;
use crate::types::GuestRip;

/// One contiguous span of guest bytes the decoder turned into a block.
#[derive(Debug, Clone, Copy)]
pub struct DecodedBlockRange {
    /// Guest address the block starts at.
    pub entry: GuestRip,
    /// Start address of the decoded range (equal to `entry` in practice).
    pub start: u64,
    /// Length in bytes of the decoded range.
    pub length: u64,
}

/// A single decoded guest instruction, opaque to the engine beyond the
/// handful of fields it needs to drive SMC guards and dispatch.
#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    /// Guest address of this instruction.
    pub address: GuestRip,
    /// Length in bytes.
    pub length: u8,
    /// Opcode table index the dispatcher should look up; `None` means no
    /// handler is registered for this encoding.
    pub op_index: Option<u32>,
    /// Whether the decoder saw a LOCK prefix on this instruction.
    pub has_lock_prefix: bool,
    /// Raw bytes, used to seed the SMC guard's comparison value.
    pub raw: Vec<u8>,
}

/// Callback the decoder invokes once per discovered block, before
/// instruction-level decode of that block begins.
pub type BlockCallback<'a> = dyn FnMut(DecodedBlockRange) + 'a;

/// Decodes guest machine code into blocks of instructions.
pub trait FrontendDecoder: Send + Sync {
    /// Decode starting at `entry`, reporting each discovered block through
    /// `on_block` as it's found, and returning the flattened instruction
    /// stream in program order.
    fn decode_instructions_at_entry(
        &self,
        entry: GuestRip,
        multiblock: bool,
        on_block: &mut BlockCallback<'_>,
    ) -> Result<Vec<DecodedInstruction>, SdkError>;
}

/// Outcome of dispatching one instruction to the IR builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Instruction translated successfully; the block may continue.
    Handled,
    /// Instruction translated successfully and terminates the block (e.g. an
    /// unconditional branch); further instructions in this decode batch are
    /// not reachable fallthrough and should not be appended.
    HandledTerminal,
    /// No handler exists for this instruction.
    Unhandled,
    /// A handler exists but detected an internal inconsistency (e.g. a LOCK
    /// prefix mismatch) while processing this instruction.
    DispatchError,
}

/// Builds IR for one compile, instruction by instruction.
///
/// Implementations own a reusable buffer; `reset` must fully clear it so the
/// builder can be reused across unrelated compiles without leaking state
/// from a prior one.
pub trait DispatchBuilder: Send + Sync {
    /// Opaque IR produced by `finalize`.
    type Ir;
    /// Allocation metadata a register-allocation pass may attach.
    type RegisterAllocationData;

    /// Clear any state left over from a previous compile.
    fn reset(&mut self);

    /// Emit IR for one instruction looked up by `op_index` into the opcode
    /// table; `is_last_in_block` tells the builder whether to also emit an
    /// implicit fallthrough edge.
    fn dispatch(&mut self, instr: &DecodedInstruction, is_last_in_block: bool) -> DispatchOutcome;

    /// Emit an exit for an instruction the dispatcher couldn't handle.
    fn emit_invalid_op(&mut self, instr: &DecodedInstruction);

    /// Emit an early-exit sequence at `next_pc`, used both for normal block
    /// termination and for bailing out after a partial translation.
    fn emit_exit_function(&mut self, next_pc: GuestRip);

    /// Emit an SMC guard: compare the live guest bytes at `instr.address`
    /// against the snapshot taken at decode time, branching to a recovery
    /// path that removes this thread's cache entry for the block and exits
    /// if they differ.
    fn emit_smc_guard(&mut self, instr: &DecodedInstruction);

    /// Notify the builder that instruction processing for this PC finished;
    /// mirrors the original `FinishOp(nextPC, isLast)` hook.
    fn finish_op(&mut self, next_pc: GuestRip, is_last: bool);

    /// Finish the block and hand back the IR plus translated instruction
    /// and byte counters.
    fn finalize(&mut self) -> (Self::Ir, u64, u64);
}

/// Runs optimization and register-allocation passes over IR produced by a
/// `DispatchBuilder`.
pub trait PassManager: Send + Sync {
    /// Opaque IR type, matching the builder's.
    type Ir;
    /// Register allocation metadata a RA pass may produce.
    type RegisterAllocationData;

    /// Run the configured passes in order, mutating `ir` in place.
    fn run(&self, ir: &mut Self::Ir) -> Option<Self::RegisterAllocationData>;

    /// Whether a register-allocation pass is installed.
    fn has_register_allocation_pass(&self) -> bool;
}

/// Host machine code plus whatever debug/relocation metadata the backend
/// attached to it.
#[derive(Debug, Clone)]
pub struct CompiledCode {
    /// Emitted machine code bytes.
    pub code: Vec<u8>,
    /// Offset of the callable entry point within `code`.
    pub entry_offset: u32,
    /// Relocations that must be applied before the code is executable, or
    /// re-applied when materializing from the object cache.
    pub relocations: Vec<crate::relocation::Relocation>,
}

/// Emits host machine code from IR. External to this crate exactly like the
/// decoder: the engine never assumes an instruction set or calling
/// convention beyond what `CompiledCode` describes.
pub trait CodegenBackend: Send + Sync {
    /// Opaque IR type, matching the builder/pass-manager's.
    type Ir;
    /// Register allocation metadata, matching the pass manager's.
    type RegisterAllocationData;

    /// Compile `ir` for `rip`, given optional register-allocation metadata.
    fn compile_code(
        &self,
        rip: GuestRip,
        ir: &Self::Ir,
        ra_data: Option<&Self::RegisterAllocationData>,
    ) -> Result<CompiledCode, SdkError>;

    /// Human-readable backend name, used for symbol registration.
    fn name(&self) -> &str;
}

/// Notified when guest code touches a page for the first time, so the host
/// can arrange write-trapping for SMC detection.
pub trait SyscallHandler: Send + Sync {
    /// Mark `[start, start+length)` as guest-executable; `newly_touched` is
    /// true the first time any byte in this range's pages was recorded.
    fn mark_guest_executable_range(&self, start: u64, length: u64, newly_touched: bool);
}

/// Resolves named thunks (host-side trampolines for guest-visible runtime
/// calls) to their current-process pointer.
pub trait ThunkHandler: Send + Sync {
    /// Look up a thunk by its stable symbol id, returning its current
    /// address in this process.
    fn lookup_thunk(&self, symbol: u64) -> Option<usize>;
}

/// Registers compiled code ranges with a host symbolizer (for profilers,
/// debuggers, crash reporters).
pub trait SymbolRegistrar: Send + Sync {
    /// Register `[addr, addr+len)` under `name`.
    fn register(&self, addr: usize, len: usize, name: &str);
}

/// Delivers a pause/stop/resume request to a specific OS thread. Exists so
/// the supervisor's state machine is testable without a real POSIX signal.
pub trait PauseDelivery: Send + Sync {
    /// Ask `tid` to observe `reason` at its next safepoint.
    fn notify(&self, tid: u32, reason: crate::types::SignalReason);
}

/// Starts and stops an out-of-process debug protocol server, used only when
/// `Config::gdb_server` is set. Out of scope for this crate the same way the
/// decoder and backend are: the engine calls `start`/`stop` at the right
/// points in the thread lifecycle and otherwise knows nothing about the wire
/// protocol.
pub trait DebugServer: Send + Sync {
    /// Start listening/attaching. Called once, from `InitCore`, before the
    /// parent thread is handed back to the embedder.
    fn start(&self);

    /// Stop listening/attaching. Called on final shutdown.
    fn stop(&self);
}

/// Round-trips IR through a text representation, used only when
/// `Config::validate_ir_parser` is set. A real decoder/IR crate wires a
/// pretty-printer and a matching parser here; the default build carries no
/// implementation because self-validation is opt-in.
pub trait IrTextCodec: Send + Sync {
    /// IR type this codec serializes, matching the dispatch builder's.
    type Ir;

    /// Render `ir` as text.
    fn to_text(&self, ir: &Self::Ir) -> String;

    /// Parse previously rendered text back into IR.
    fn from_text(&self, text: &str) -> Self::Ir;
}
