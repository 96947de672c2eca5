//! C10 — Dispatcher interface: the hand-written host trampoline that enters
//! compiled code and fields unresolved-block faults.
//!
//! The literal trampoline is external to this engine exactly like the
//! decoder and backend (§1): a real one is a handful of hand-assembled
//! instructions that read `RuntimeHelperTable`/`DispatcherConfig` out of the
//! thread's dispatcher frame, jump into compiled code, and land back here
//! either because a block finished (fell through to an exit stub) or
//! because it hit an unresolved target and called back into
//! `CompileBlockJit`. This module defines that trait boundary plus the
//! C-ABI-shaped config structs a real trampoline would read, and ships
//! [`StubDispatcher`]: a test double that "runs" a [`GuestProgram`] (a tiny
//! fake compiled-code representation) so the rest of the engine --
//! coordinator, supervisor, invalidation -- can be driven and tested
//! end-to-end without a real code generator.
//!
//! Grounded on `raya-engine/src/jit/runtime/trampoline.rs`'s
//! `RuntimeContext`/`RuntimeHelperTable` shape for the published config
//! structs, and on `Core.cpp`'s `ExecuteDispatch`/`ExecuteJITCallback` split
//! for the trait's two entry points.

use crate::thread_state::ThreadState;
use dbt_sdk::{CodegenBackend, DispatchBuilder, ExitReason, GuestRip, HostCodePtr};
use std::sync::Arc;

/// Function-pointer table emitted code reads to resolve runtime helpers
/// without a full symbol lookup, mirroring the original's dispatcher frame
/// fields (`L1Pointer`, `L2Pointer`, `ExitFunctionLinker`, callback entry).
/// Every field is a raw address (`usize`) rather than a typed function
/// pointer: this engine never calls through these itself, it only publishes
/// them for a real backend's immediate-load codegen to consume.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RuntimeHelperTable {
    /// Address of the exit-function-linker trampoline.
    pub exit_function_linker: usize,
    /// Address of the thread's L1 lookup table.
    pub l1_pointer: usize,
    /// Address of the thread's L2 lookup table.
    pub l2_pointer: usize,
    /// Entry point for host-to-guest callbacks.
    pub callback_entry: usize,
    /// Entry point resumed after a signal-driven pause/stop.
    pub signal_return_entry: usize,
}

/// The published per-thread dispatcher configuration a real trampoline
/// reads at a fixed offset within thread state.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Runtime helper addresses for this thread.
    pub helpers: RuntimeHelperTable,
}

/// What happened after one call into compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStep {
    /// The block fell through to another guest address; the caller should
    /// resolve and enter it in turn.
    Continue(GuestRip),
    /// Execution left the dispatch loop for `reason` (syscall suspend,
    /// shutdown, debug event, ...).
    Exit(ExitReason),
}

/// The host trampoline boundary: enter compiled code, and enter a
/// host-to-guest callback. Implementations never see decode/IR/backend
/// types; they only ever touch [`HostCodePtr`]s already resolved by the
/// caller (the coordinator, via `Context::compile_block`).
pub trait Dispatcher<D, C>: Send + Sync
where
    D: DispatchBuilder,
    C: CodegenBackend<Ir = D::Ir, RegisterAllocationData = D::RegisterAllocationData>,
{
    /// Enter compiled code at `entry` (the block translated from `rip`),
    /// returning what happens next.
    fn execute_dispatch(&self, thread: &Arc<ThreadState<D, C>>, entry: HostCodePtr, rip: GuestRip) -> DispatchStep;

    /// Enter compiled code as a host-to-guest callback rather than a normal
    /// dispatch continuation.
    fn execute_jit_callback(&self, thread: &Arc<ThreadState<D, C>>, entry: HostCodePtr, rip: GuestRip) -> DispatchStep;
}

/// A tiny fake "compiled code" representation driving [`StubDispatcher`]:
/// given the guest RIP a block was entered at, says what that block does
/// without any actual machine code existing for it.
pub trait GuestProgram: Send + Sync {
    /// Decide what the block at `rip` does.
    fn step(&self, rip: GuestRip) -> DispatchStep;
}

/// A [`GuestProgram`] that walks a fixed, pre-recorded trace of
/// `(rip -> next step)` pairs, falling back to `Exit(UnknownError)` for any
/// RIP not in the trace (a test asked the dispatcher to go somewhere it
/// didn't script).
pub struct ScriptedProgram {
    steps: rustc_hash::FxHashMap<GuestRip, DispatchStep>,
}

impl ScriptedProgram {
    /// Build a program from an explicit `(rip, step)` list.
    pub fn new(steps: impl IntoIterator<Item = (GuestRip, DispatchStep)>) -> Self {
        ScriptedProgram { steps: steps.into_iter().collect() }
    }
}

impl GuestProgram for ScriptedProgram {
    fn step(&self, rip: GuestRip) -> DispatchStep {
        self.steps.get(&rip).copied().unwrap_or(DispatchStep::Exit(ExitReason::UnknownError))
    }
}

/// Stand-in dispatcher used in tests and by embedders that haven't wired a
/// real backend yet: "executing" a block just means asking the bound
/// [`GuestProgram`] what it does. Never touches `entry`; a real trampoline
/// would be the thing actually jumping there.
pub struct StubDispatcher<P: GuestProgram> {
    program: P,
}

impl<P: GuestProgram> StubDispatcher<P> {
    /// Bind a stub dispatcher to a scripted program.
    pub fn new(program: P) -> Self {
        StubDispatcher { program }
    }
}

impl<D, C, P> Dispatcher<D, C> for StubDispatcher<P>
where
    D: DispatchBuilder,
    C: CodegenBackend<Ir = D::Ir, RegisterAllocationData = D::RegisterAllocationData>,
    P: GuestProgram,
{
    fn execute_dispatch(&self, _thread: &Arc<ThreadState<D, C>>, _entry: HostCodePtr, rip: GuestRip) -> DispatchStep {
        self.program.step(rip)
    }

    fn execute_jit_callback(&self, _thread: &Arc<ThreadState<D, C>>, _entry: HostCodePtr, rip: GuestRip) -> DispatchStep {
        self.program.step(rip)
    }
}
