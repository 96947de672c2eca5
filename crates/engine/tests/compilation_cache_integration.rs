//! Integration tests exercising `Context`'s public embedding API end to
//! end: compile-cache hits/misses, self-modifying-code guard emission,
//! object-cache persistence across a torn-down context, and single-step.
//!
//! These cover the end-to-end scenarios that need a whole `Context` wired
//! together rather than one component in isolation (see the unit tests
//! alongside each module for the component-level checks).

use dbt_engine::Context;
use dbt_sdk::{
    BlockCallback, CodegenBackend, CompiledCode, Config, DecodedBlockRange, DecodedInstruction,
    DispatchBuilder, DispatchOutcome, FrontendDecoder, GuestRip, NamedSymbol, ObjectCacheMode,
    PassManager, PauseDelivery, SdkError, SignalReason, SmcChecks, SyscallHandler, ThunkHandler,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default, Clone)]
struct RecordingIr {
    guard_count: usize,
    op_count: usize,
}

/// A `DispatchBuilder` that records how many SMC guards and real ops it was
/// asked to emit, so tests can assert on the pipeline's guard-emission
/// contract without a real backend.
struct RecordingBuilder {
    ir: RecordingIr,
}

impl DispatchBuilder for RecordingBuilder {
    type Ir = RecordingIr;
    type RegisterAllocationData = ();

    fn reset(&mut self) {
        self.ir = RecordingIr::default();
    }

    fn dispatch(&mut self, _instr: &DecodedInstruction, _is_last: bool) -> DispatchOutcome {
        self.ir.op_count += 1;
        DispatchOutcome::Handled
    }

    fn emit_invalid_op(&mut self, _instr: &DecodedInstruction) {}

    fn emit_exit_function(&mut self, _next_pc: GuestRip) {}

    fn emit_smc_guard(&mut self, _instr: &DecodedInstruction) {
        self.ir.guard_count += 1;
    }

    fn finish_op(&mut self, _next_pc: GuestRip, _is_last: bool) {}

    fn finalize(&mut self) -> (Self::Ir, u64, u64) {
        (self.ir.clone(), self.ir.op_count as u64, self.ir.op_count as u64 * 4)
    }
}

/// Decodes a fixed two-instruction block regardless of entry point.
struct TwoInstrDecoder;

impl FrontendDecoder for TwoInstrDecoder {
    fn decode_instructions_at_entry(
        &self,
        entry: GuestRip,
        _multiblock: bool,
        on_block: &mut BlockCallback<'_>,
    ) -> Result<Vec<DecodedInstruction>, SdkError> {
        on_block(DecodedBlockRange { entry, start: entry.0, length: 8 });
        Ok(vec![
            DecodedInstruction { address: entry, length: 4, op_index: Some(1), has_lock_prefix: false, raw: vec![0; 4] },
            DecodedInstruction { address: GuestRip(entry.0 + 4), length: 4, op_index: Some(1), has_lock_prefix: false, raw: vec![0; 4] },
        ])
    }
}

struct NullPassManager;
impl PassManager for NullPassManager {
    type Ir = RecordingIr;
    type RegisterAllocationData = ();
    fn run(&self, _ir: &mut Self::Ir) -> Option<()> {
        None
    }
    fn has_register_allocation_pass(&self) -> bool {
        false
    }
}

struct NullSyscallHandler;
impl SyscallHandler for NullSyscallHandler {
    fn mark_guest_executable_range(&self, _start: u64, _length: u64, _newly_touched: bool) {}
}

/// A backend that encodes the guard/op counts it was handed into the
/// "machine code" bytes, and counts how many times it was invoked, so a
/// test can assert the backend was (or wasn't) called.
struct CountingBackend {
    compiles: AtomicUsize,
}

impl CodegenBackend for CountingBackend {
    type Ir = RecordingIr;
    type RegisterAllocationData = ();

    fn compile_code(&self, _rip: GuestRip, ir: &Self::Ir, _ra: Option<&()>) -> Result<CompiledCode, SdkError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        Ok(CompiledCode { code: vec![ir.guard_count as u8, ir.op_count as u8, 0xC3], entry_offset: 0, relocations: vec![] })
    }

    fn name(&self) -> &str {
        "counting"
    }
}

struct NullSymbols;
impl dbt_engine::NamedSymbolResolver for NullSymbols {
    fn resolve(&self, _symbol: NamedSymbol) -> u64 {
        0
    }
}

struct NullThunks;
impl ThunkHandler for NullThunks {
    fn lookup_thunk(&self, _symbol: u64) -> Option<usize> {
        None
    }
}

struct NullPauseDelivery;
impl PauseDelivery for NullPauseDelivery {
    fn notify(&self, _tid: u32, _reason: SignalReason) {}
}

type TestContext = Context<RecordingBuilder, CountingBackend, dbt_engine::StubDispatcher<dbt_engine::ScriptedProgram>>;

fn make_context_with_cache(config: Config) -> (TestContext, Arc<CountingBackend>) {
    let backend = Arc::new(CountingBackend { compiles: AtomicUsize::new(0) });
    let ctx = Context::new(
        config,
        backend.clone(),
        Arc::new(dbt_engine::StubDispatcher::new(dbt_engine::ScriptedProgram::new([]))),
        Arc::new(TwoInstrDecoder),
        Arc::new(NullPassManager),
        Arc::new(NullSyscallHandler),
        Arc::new(NullSymbols),
        Arc::new(NullThunks),
        Arc::new(NullPauseDelivery),
        Box::new(|| RecordingBuilder { ir: RecordingIr::default() }),
    );
    (ctx, backend)
}

/// S4-style check: with `SmcChecks::Full`, every decoded instruction gets an
/// SMC guard; with anything else, none do. The guard sequence itself (the
/// actual compare-and-recover logic the guest CPU runs) is the backend's
/// concern -- this engine's contract is only that it asks for one per
/// instruction when configured to.
#[test]
fn smc_full_mode_emits_one_guard_per_instruction() {
    let mut config = Config::default();
    config.smc_checks = SmcChecks::Full;
    let (ctx, backend) = make_context_with_cache(config);
    let thread = ctx.init_core(GuestRip(0x400000), 0);

    let ptr = ctx.compile_block(&thread, GuestRip(0x400000)).unwrap();
    let bytes = thread.code_buffer.read(ptr, 3).unwrap();
    assert_eq!(bytes[0], 2, "two instructions decoded, both should carry a guard");
    assert_eq!(bytes[1], 2, "both instructions should have translated");
    assert_eq!(backend.compiles.load(Ordering::SeqCst), 1);
}

#[test]
fn smc_mtrack_mode_emits_no_guards() {
    let mut config = Config::default();
    config.smc_checks = SmcChecks::MTrack;
    let (ctx, _backend) = make_context_with_cache(config);
    let thread = ctx.init_core(GuestRip(0x400000), 0);

    let ptr = ctx.compile_block(&thread, GuestRip(0x400000)).unwrap();
    let bytes = thread.code_buffer.read(ptr, 3).unwrap();
    assert_eq!(bytes[0], 0, "MTrack relies on page write-trapping, not inline guards");
}

/// S5 — object-cache round trip: compile a block with `ReadWrite`, drain
/// the serialization job, then stand up a *fresh* context pointed at the
/// same on-disk file and confirm the new context services the same RIP
/// straight from the cache without ever invoking its own backend.
#[test]
fn object_cache_serves_a_fresh_context_without_recompiling() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("session.objcache");

    {
        let mut config = Config::default();
        config.cache_object_code_compilation = ObjectCacheMode::ReadWrite;
        let backend = Arc::new(CountingBackend { compiles: AtomicUsize::new(0) });
        let ctx = build_context_with_object_cache_path(config, backend.clone(), Some(cache_path.clone()));
        let thread = ctx.init_core(GuestRip(0x410000), 0);
        let _ = ctx.compile_block(&thread, GuestRip(0x410000)).unwrap();
        assert_eq!(backend.compiles.load(Ordering::SeqCst), 1);
        // Dropping `ctx` here drops the `ObjectCacheService`, which joins its
        // worker thread and persists to `cache_path` before returning.
    }

    let mut config = Config::default();
    config.cache_object_code_compilation = ObjectCacheMode::Read;
    let backend = Arc::new(CountingBackend { compiles: AtomicUsize::new(0) });
    let ctx = build_context_with_object_cache_path(config, backend.clone(), Some(cache_path));
    let thread = ctx.init_core(GuestRip(0x410000), 0);

    let ptr = ctx.compile_block(&thread, GuestRip(0x410000)).unwrap();
    assert!(!ptr.is_null());
    assert_eq!(backend.compiles.load(Ordering::SeqCst), 0, "second context must not invoke its own backend");
}

fn build_context_with_object_cache_path(
    config: Config,
    backend: Arc<CountingBackend>,
    cache_path: Option<std::path::PathBuf>,
) -> TestContext {
    Context::new(
        config,
        backend,
        Arc::new(dbt_engine::StubDispatcher::new(dbt_engine::ScriptedProgram::new([]))),
        Arc::new(TwoInstrDecoder),
        Arc::new(NullPassManager),
        Arc::new(NullSyscallHandler),
        Arc::new(NullSymbols),
        Arc::new(NullThunks),
        Arc::new(NullPauseDelivery),
        Box::new(|| RecordingBuilder { ir: RecordingIr::default() }),
    )
    .with_object_cache_path(cache_path)
}

/// S6 — single-step: after `Step()`, every thread's cache has been cleared
/// (forcing the next compile to honor the temporarily forced
/// `max_inst_per_block = 1`) and the configuration is restored to what it
/// was before the call.
#[test]
fn step_clears_caches_and_restores_config() {
    let config = Config::default();
    let saved_max = config.max_inst_per_block;
    let (ctx, _backend) = make_context_with_cache(config);
    let thread = ctx.init_core(GuestRip(0x420000), 0);
    ctx.compile_block(&thread, GuestRip(0x420000)).unwrap();
    assert!(!ctx.find_host_code_for_rip(&thread, GuestRip(0x420000)).is_null());

    ctx.step();

    assert!(
        ctx.find_host_code_for_rip(&thread, GuestRip(0x420000)).is_null(),
        "step must clear the thread's cache so the single-instruction block is recompiled"
    );
    assert_eq!(ctx.current_config().max_inst_per_block, saved_max);
    assert_eq!(ctx.current_config().running_mode, dbt_sdk::RunningMode::Run);
}

#[test]
fn invalid_32bit_entrypoint_is_rejected() {
    let mut config = Config::default();
    config.is_64bit_mode = false;
    let (ctx, _backend) = make_context_with_cache(config);
    let thread = ctx.init_core(GuestRip(0x400000), 0);

    let err = ctx.compile_block(&thread, GuestRip(0x1_0000_0000)).unwrap_err();
    assert!(matches!(err, dbt_engine::CoreError::Supervisor(_)));
}
