//! Context: the top-level embedding-API object (§6) tying together the
//! thread list, every shared lock/structure, the supervisor, the object
//! cache, and the dispatcher into one value an embedder constructs and tears
//! down explicitly.
//!
//! Grounded on `Core.cpp`'s `ContextImpl` (the process-wide singleton
//! holding `Threads`, `CodeInvalidationMutex`, `CodePages`, `BlockLinks`,
//! and the supervisor's quiescence state) and, for the "one struct instead
//! of scattered globals" shape, on `raya-engine/src/engine.rs`'s top-level
//! `Engine` type composing its own scheduler/cache/linker fields.

use crate::cache::{BlockLinkGraph, CodePageIndex};
use crate::code_buffer::CodeBuffer;
use crate::coordinator::CodeCacheCoordinator;
use crate::custom_ir::{CustomIrBuilder, CustomIrHandlers};
use crate::dispatcher::{DispatchStep, Dispatcher};
use crate::error::{CoreResult, ObjectCacheError};
use crate::invalidation::InvalidationEngine;
use crate::object_cache::ObjectCacheService;
use crate::pipeline::CompilationPipeline;
use crate::relocation::NamedSymbolResolver;
use crate::stats::ThreadStatsSnapshot;
use crate::supervisor::ThreadSupervisor;
use crate::thread_state::{DebugData, ThreadId, ThreadState};
use dbt_sdk::{
    CodegenBackend, Config, CpuState, DebugServer, DispatchBuilder, ExitReason, FrontendDecoder,
    GuestRip, HostCodePtr, IrTextCodec, ObjectCacheMode, PassManager, PauseDelivery, RunningMode,
    SymbolRegistrar, SyscallHandler, ThunkHandler,
};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Default capacity (in bytes) of the shared executable code buffer a
/// `Context` allocates for itself, large enough for a handful of thousand
/// small blocks before a clear is needed.
const DEFAULT_CODE_BUFFER_CAPACITY: usize = 16 * 1024 * 1024;

/// A loaded ahead-of-time IR cache entry, identified by its content hash so
/// reloading an unchanged file is a no-op from the debug server's point of
/// view and unloading is unambiguous even if the file on disk has since
/// changed underneath it.
#[derive(Debug, Clone)]
pub struct AotCacheEntry {
    /// Path the entry was loaded from.
    pub filename: String,
    /// SHA-256 of the file's bytes at load time.
    pub content_hash: [u8; 32],
}

/// A callback invoked with intermediate (non-shutdown) exit reasons while
/// [`Context::run_until_exit`] is driving a thread, in place of returning
/// control to the caller for each one.
pub type CustomExitHandler = Box<dyn Fn(ExitReason) + Send + Sync>;

/// The engine's single process-wide mutable-state owner: the thread list,
/// the code-invalidation lock that guards it against concurrent compiles,
/// the page index, the block-link graph, the custom-IR registry, the
/// object-cache service, and the thread supervisor.
pub struct Context<D, C, Disp>
where
    D: DispatchBuilder,
    C: CodegenBackend<Ir = D::Ir, RegisterAllocationData = D::RegisterAllocationData>,
    Disp: Dispatcher<D, C>,
{
    threads: RwLock<Vec<Arc<ThreadState<D, C>>>>,
    /// Shared by compilers, exclusive by invalidators (§5, lock order #1).
    code_invalidation: RwLock<()>,
    page_index: Arc<CodePageIndex>,
    block_links: Arc<BlockLinkGraph>,
    custom_ir: Arc<CustomIrHandlers>,
    object_cache: ObjectCacheService,
    supervisor: ThreadSupervisor,
    code_buffer: Arc<CodeBuffer>,
    backend: Arc<C>,
    dispatcher: Arc<Disp>,
    decoder: Arc<dyn FrontendDecoder>,
    pass_manager: Arc<dyn PassManager<Ir = D::Ir, RegisterAllocationData = D::RegisterAllocationData>>,
    syscall_handler: Arc<dyn SyscallHandler>,
    symbols: Arc<dyn NamedSymbolResolver>,
    thunks: Arc<dyn ThunkHandler>,
    symbol_registrar: Option<Arc<dyn SymbolRegistrar>>,
    debug_server: Option<Arc<dyn DebugServer>>,
    ir_codec: Option<Arc<dyn IrTextCodec<Ir = D::Ir>>>,
    custom_exit_handler: Option<CustomExitHandler>,
    builder_factory: Box<dyn Fn() -> D + Send + Sync>,
    config: RwLock<Config>,
    next_thread_id: AtomicU64,
    initial_rip: Mutex<Option<GuestRip>>,
    memory_shared: AtomicBool,
    aot_entries: RwLock<FxHashMap<[u8; 32], AotCacheEntry>>,
}

impl<D, C, Disp> Context<D, C, Disp>
where
    D: DispatchBuilder,
    C: CodegenBackend<Ir = D::Ir, RegisterAllocationData = D::RegisterAllocationData>,
    Disp: Dispatcher<D, C>,
{
    /// Construct a context around its collaborators. `builder_factory`
    /// produces a fresh, owned `D` for each thread created through
    /// [`init_core`](Self::init_core)/[`spawn_guest_thread`](Self::spawn_guest_thread),
    /// since a `DispatchBuilder`'s reusable buffer must not be shared across
    /// threads the way the backend and code buffer are.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        backend: Arc<C>,
        dispatcher: Arc<Disp>,
        decoder: Arc<dyn FrontendDecoder>,
        pass_manager: Arc<dyn PassManager<Ir = D::Ir, RegisterAllocationData = D::RegisterAllocationData>>,
        syscall_handler: Arc<dyn SyscallHandler>,
        symbols: Arc<dyn NamedSymbolResolver>,
        thunks: Arc<dyn ThunkHandler>,
        pause_delivery: Arc<dyn PauseDelivery>,
        builder_factory: Box<dyn Fn() -> D + Send + Sync>,
    ) -> Self {
        let object_cache_mode = config.cache_object_code_compilation;
        Context {
            threads: RwLock::new(Vec::new()),
            code_invalidation: RwLock::new(()),
            page_index: Arc::new(CodePageIndex::new()),
            block_links: Arc::new(BlockLinkGraph::new()),
            custom_ir: Arc::new(CustomIrHandlers::new()),
            object_cache: ObjectCacheService::new(object_cache_mode, None),
            supervisor: ThreadSupervisor::new(pause_delivery),
            code_buffer: Arc::new(CodeBuffer::new(DEFAULT_CODE_BUFFER_CAPACITY)),
            backend,
            dispatcher,
            decoder,
            pass_manager,
            syscall_handler,
            symbols,
            thunks,
            symbol_registrar: None,
            debug_server: None,
            ir_codec: None,
            custom_exit_handler: None,
            builder_factory,
            config: RwLock::new(config),
            next_thread_id: AtomicU64::new(1),
            initial_rip: Mutex::new(None),
            memory_shared: AtomicBool::new(false),
            aot_entries: RwLock::new(FxHashMap::default()),
        }
    }

    /// Attach a symbol registrar, used for `Config::block_jit_naming`.
    pub fn with_symbol_registrar(mut self, registrar: Arc<dyn SymbolRegistrar>) -> Self {
        self.symbol_registrar = Some(registrar);
        self
    }

    /// Attach an IR text codec, used when `Config::validate_ir_parser` is set.
    pub fn with_ir_codec(mut self, codec: Arc<dyn IrTextCodec<Ir = D::Ir>>) -> Self {
        self.ir_codec = Some(codec);
        self
    }

    /// Attach a debug-protocol server, started from [`init_core`](Self::init_core)
    /// when `Config::gdb_server` is set. Without one attached, a `gdb_server`
    /// config is silently a no-op -- there is nothing to start.
    pub fn with_debug_server(mut self, server: Arc<dyn DebugServer>) -> Self {
        self.debug_server = Some(server);
        self
    }

    /// Attach a callback that intercepts intermediate (non-shutdown) exits
    /// from [`run_until_exit`](Self::run_until_exit).
    pub fn with_custom_exit_handler(mut self, handler: CustomExitHandler) -> Self {
        self.custom_exit_handler = Some(handler);
        self
    }

    /// Rebind the object cache to an on-disk path (defaults to none, i.e.
    /// purely in-memory, even when a read/write mode is configured). Must be
    /// called before [`init_core`](Self::init_core), since it replaces the
    /// cache [`new`](Self::new) already started.
    pub fn with_object_cache_path(mut self, path: Option<PathBuf>) -> Self {
        let mode = self.config.read().cache_object_code_compilation;
        self.object_cache = ObjectCacheService::new(mode, path);
        self
    }

    fn make_pipeline(&self) -> CompilationPipeline<D> {
        CompilationPipeline::new(
            (self.builder_factory)(),
            self.decoder.clone(),
            self.pass_manager.clone(),
            self.syscall_handler.clone(),
            self.page_index.clone(),
            self.custom_ir.clone(),
            self.ir_codec.clone(),
        )
    }

    /// Create the parent (first) thread with the default poisoned CPU state
    /// (per §6, `RIP` is left at its all-ones sentinel rather than seeded
    /// from `initial_rip` directly -- a real guest entry stub is what
    /// actually transfers control there; `initial_rip` instead becomes the
    /// address [`run_until_exit`](Self::run_until_exit) starts dispatching
    /// from) and `stack_ptr` installed in the RSP general-purpose slot.
    pub fn init_core(&self, initial_rip: GuestRip, stack_ptr: u64) -> Arc<ThreadState<D, C>> {
        if self.config.read().gdb_server {
            if let Some(server) = &self.debug_server {
                server.start();
            }
        }
        let mut cpu_state = CpuState::default_for_new_thread();
        cpu_state.gregs[4] = stack_ptr;
        let id = ThreadId(self.next_thread_id.fetch_add(1, Ordering::Relaxed));
        let pipeline = self.make_pipeline();
        let thread = Arc::new(ThreadState::new(id, None, cpu_state, pipeline, self.backend.clone(), self.code_buffer.clone()));
        self.threads.write().push(thread.clone());
        *self.initial_rip.lock() = Some(initial_rip);
        thread
    }

    /// Create an additional guest thread inheriting `parent`'s current
    /// register file, as if from a `clone()`/`pthread_create`-equivalent.
    pub fn spawn_guest_thread(&self, parent: &Arc<ThreadState<D, C>>) -> Arc<ThreadState<D, C>> {
        let cpu_state = *parent.cpu_state.lock();
        let id = ThreadId(self.next_thread_id.fetch_add(1, Ordering::Relaxed));
        let pipeline = self.make_pipeline();
        let thread = Arc::new(ThreadState::new(id, Some(parent.id), cpu_state, pipeline, self.backend.clone(), self.code_buffer.clone()));
        self.threads.write().push(thread.clone());
        thread
    }

    /// Resolve `rip` to a host code pointer for `thread`, holding the
    /// code-invalidation lock in shared mode for the duration (§4.5/§5).
    pub fn compile_block(&self, thread: &Arc<ThreadState<D, C>>, rip: GuestRip) -> CoreResult<HostCodePtr> {
        ThreadSupervisor::check_address_width(rip, self.config.read().is_64bit_mode)?;
        let _shared = self.code_invalidation.read();
        let peers = self.threads.read().clone();
        let config = self.config.read().clone();
        let result = CodeCacheCoordinator::compile_block(
            thread,
            &peers,
            &self.page_index,
            &self.object_cache,
            self.symbols.as_ref(),
            self.thunks.as_ref(),
            self.symbol_registrar.as_deref(),
            &config,
            rip,
        );
        if let Err(e) = &result {
            log::error!("CompileBlockJit failed to produce code for {rip:?}: {e}");
        }
        result
    }

    /// Debug-only force compile: evicts any prior cache/debug entry for
    /// `rip` first, so the next dispatch is guaranteed to see freshly
    /// translated code.
    pub fn compile_rip(&self, thread: &Arc<ThreadState<D, C>>, rip: GuestRip) -> CoreResult<HostCodePtr> {
        thread.lookup_cache.erase(rip);
        thread.erase_debug_data(rip);
        self.compile_block(thread, rip)
    }

    /// Drive `thread` from the entry point recorded by
    /// [`init_core`](Self::init_core), returning once a `Shutdown` exit
    /// fires. Non-shutdown exits are routed through the installed
    /// [`CustomExitHandler`], if any, and dispatch resumes at the same RIP
    /// afterward; with no handler installed, the first non-shutdown exit is
    /// returned directly.
    pub fn run_until_exit(&self, thread: &Arc<ThreadState<D, C>>) -> ExitReason {
        let mut rip = {
            let guard = self.initial_rip.lock();
            (*guard).expect("run_until_exit called before init_core")
        };

        thread.running.store(true, Ordering::Release);
        self.supervisor.idle_gate().enter();

        let final_reason = loop {
            let ptr = match self.compile_block(thread, rip) {
                Ok(ptr) => ptr,
                Err(_) => break ExitReason::UnknownError,
            };
            match self.dispatcher.execute_dispatch(thread, ptr, rip) {
                DispatchStep::Continue(next) => rip = next,
                DispatchStep::Exit(reason) => {
                    if reason == ExitReason::Shutdown || self.custom_exit_handler.is_none() {
                        break reason;
                    }
                    (self.custom_exit_handler.as_ref().unwrap())(reason);
                }
            }
        };

        *thread.exit_reason.lock() = final_reason;
        thread.running.store(false, Ordering::Release);
        self.supervisor.idle_gate().leave();
        final_reason
    }

    /// Host-to-guest callback entry: compile (if needed) and enter `rip` as
    /// a callback rather than a normal dispatch continuation.
    pub fn handle_callback(&self, thread: &Arc<ThreadState<D, C>>, rip: GuestRip) -> CoreResult<DispatchStep> {
        let ptr = self.compile_block(thread, rip)?;
        Ok(self.dispatcher.execute_jit_callback(thread, ptr, rip))
    }

    /// Register a custom IR entrypoint. Returns `false` if one is already
    /// registered at `rip`, and rejects a >32-bit address while the guest is
    /// configured for 32-bit mode.
    pub fn add_custom_ir_entrypoint(&self, rip: GuestRip, builder: CustomIrBuilder) -> CoreResult<bool> {
        ThreadSupervisor::check_address_width(rip, self.config.read().is_64bit_mode)?;
        Ok(self.custom_ir.add(rip, builder))
    }

    /// Remove the custom IR entrypoint at `rip`, atomically (under the
    /// exclusive invalidation lock) evicting every thread's cached compile
    /// of it first so no thread dispatches to a stale one afterward. A
    /// custom entrypoint's block never registers itself with the page
    /// index (there is no decoded guest range to record), so this evicts
    /// directly by RIP rather than going through
    /// [`InvalidationEngine::invalidate_range`].
    pub fn remove_custom_ir_entrypoint(&self, rip: GuestRip) {
        let _exclusive = self.code_invalidation.write();
        let threads = self.threads.read().clone();
        for thread in &threads {
            thread.lookup_cache.erase(rip);
            thread.erase_debug_data(rip);
        }
        self.block_links.invalidate_destination(rip);
        self.custom_ir.remove(rip);
    }

    /// Invalidate `[start, start+length)`, evicting every overlapping block
    /// from every thread's cache and tearing down its block links (§4.6).
    /// `after_hook`, if given, runs while the exclusive invalidation lock is
    /// still held.
    pub fn invalidate_guest_code_range(&self, start: u64, length: u64, after_hook: Option<&mut dyn FnMut()>) -> Vec<GuestRip> {
        let _exclusive = self.code_invalidation.write();
        let threads = self.threads.read().clone();
        let evicted = InvalidationEngine::invalidate_range(&self.page_index, &self.block_links, &threads, start, length);
        if let Some(hook) = after_hook {
            hook();
        }
        evicted
    }

    /// One-way latch: the first call, if TSO-auto-migration is configured
    /// and exactly one thread exists, clears that thread's lookup cache and
    /// debug store so subsequently compiled blocks pick up TSO-safe
    /// addressing. Must be called before any additional thread is created;
    /// later calls are no-ops.
    pub fn mark_memory_shared(&self) {
        if self.memory_shared.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.config.read().tso_auto_migration {
            return;
        }
        let threads = self.threads.read();
        if threads.len() == 1 {
            threads[0].clear_code_cache();
            log::info!("memory marked shared; migrated single thread to TSO-auto mode");
        }
    }

    /// Request every running thread to pause at its next safepoint and
    /// block until they're all idle.
    pub fn pause(&self) {
        let threads = self.threads.read().clone();
        self.supervisor.pause_all(&threads);
    }

    /// Resume every paused (or not-yet-started) thread.
    pub fn run(&self) {
        let threads = self.threads.read().clone();
        self.supervisor.run_all(&threads);
    }

    /// Stop every thread, optionally excluding `ignore_self` (a thread
    /// stopping every other thread as part of its own exit-group).
    pub fn stop(&self, ignore_self: Option<ThreadId>) {
        let threads = self.threads.read().clone();
        self.supervisor.stop_all(&threads, ignore_self);
    }

    /// Single-step every thread exactly one guest instruction: temporarily
    /// force `max_inst_per_block = 1` and single-step running mode, clear
    /// every thread's cache, run to the next idle point, then restore the
    /// prior configuration.
    pub fn step(&self) {
        let threads = self.threads.read().clone();
        let (saved_max, saved_mode) = {
            let mut config = self.config.write();
            let saved = (config.max_inst_per_block, config.running_mode);
            config.max_inst_per_block = 1;
            config.running_mode = RunningMode::SingleStep;
            saved
        };

        self.supervisor.step(&threads);

        let mut config = self.config.write();
        config.max_inst_per_block = saved_max;
        config.running_mode = saved_mode;
    }

    /// Debug metadata recorded for `rip` on `thread`, if any block compiled
    /// there is still cached.
    pub fn get_debug_data_for_rip(&self, thread: &Arc<ThreadState<D, C>>, rip: GuestRip) -> Option<DebugData> {
        thread.debug_store.read().get(&rip).cloned()
    }

    /// The host code pointer `thread` currently has cached for `rip`, or
    /// `HostCodePtr::NULL` if none.
    pub fn find_host_code_for_rip(&self, thread: &Arc<ThreadState<D, C>>, rip: GuestRip) -> HostCodePtr {
        thread.lookup_cache.find_block(rip)
    }

    /// Snapshot of the counters for the thread at position `index` in
    /// creation order, or `None` if out of range.
    pub fn get_runtime_stats_for_thread(&self, index: usize) -> Option<ThreadStatsSnapshot> {
        self.threads.read().get(index).map(|t| t.stats.snapshot())
    }

    /// Number of threads currently tracked by this context.
    pub fn get_thread_count(&self) -> usize {
        self.threads.read().len()
    }

    /// Snapshot of the live configuration, reflecting any in-progress
    /// [`step`](Self::step) override.
    pub fn current_config(&self) -> Config {
        self.config.read().clone()
    }

    /// Load an ahead-of-time IR cache entry from `filename`, hashing its
    /// contents so the debug server can recognize an unchanged reload.
    pub fn load_aot_ir_cache_entry(&self, filename: &str) -> CoreResult<AotCacheEntry> {
        let bytes = std::fs::read(filename).map_err(ObjectCacheError::Io)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let content_hash: [u8; 32] = hasher.finalize().into();
        let entry = AotCacheEntry { filename: filename.to_string(), content_hash };
        self.aot_entries.write().insert(content_hash, entry.clone());
        log::debug!("loaded AOT IR cache entry {filename}");
        Ok(entry)
    }

    /// Unload a previously loaded AOT IR cache entry.
    pub fn unload_aot_ir_cache_entry(&self, entry: &AotCacheEntry) {
        self.aot_entries.write().remove(&entry.content_hash);
        log::debug!("unloaded AOT IR cache entry {}", entry.filename);
    }

    /// Drop every thread state except `survivor`, matching the single
    /// surviving guest thread a `fork()` leaves behind (§4.9).
    pub fn cleanup_after_fork(&self, survivor: ThreadId) {
        let mut threads = self.threads.write();
        let kept = ThreadSupervisor::cleanup_after_fork(std::mem::take(&mut *threads), survivor);
        *threads = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{GuestProgram, ScriptedProgram, StubDispatcher};
    use dbt_sdk::{CompiledCode, DecodedInstruction, DispatchOutcome, NamedSymbol, SdkError};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct UnitIr;
    struct NullBuilder;
    impl DispatchBuilder for NullBuilder {
        type Ir = UnitIr;
        type RegisterAllocationData = ();
        fn reset(&mut self) {}
        fn dispatch(&mut self, _i: &DecodedInstruction, _l: bool) -> DispatchOutcome {
            DispatchOutcome::Handled
        }
        fn emit_invalid_op(&mut self, _i: &DecodedInstruction) {}
        fn emit_exit_function(&mut self, _n: GuestRip) {}
        fn emit_smc_guard(&mut self, _i: &DecodedInstruction) {}
        fn finish_op(&mut self, _n: GuestRip, _l: bool) {}
        fn finalize(&mut self) -> (Self::Ir, u64, u64) {
            (UnitIr, 1, 1)
        }
    }
    struct OneInstrDecoder;
    impl FrontendDecoder for OneInstrDecoder {
        fn decode_instructions_at_entry(
            &self,
            entry: GuestRip,
            _m: bool,
            on_block: &mut dbt_sdk::BlockCallback<'_>,
        ) -> Result<Vec<DecodedInstruction>, SdkError> {
            on_block(dbt_sdk::DecodedBlockRange { entry, start: entry.0, length: 4 });
            Ok(vec![DecodedInstruction { address: entry, length: 4, op_index: Some(1), has_lock_prefix: false, raw: vec![0; 4] }])
        }
    }
    struct NullPassManager;
    impl PassManager for NullPassManager {
        type Ir = UnitIr;
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
        fn mark_guest_executable_range(&self, _s: u64, _l: u64, _n: bool) {}
    }
    struct CountingBackend {
        compiles: AtomicUsize,
    }
    impl CodegenBackend for CountingBackend {
        type Ir = UnitIr;
        type RegisterAllocationData = ();
        fn compile_code(&self, _r: GuestRip, _ir: &Self::Ir, _ra: Option<&()>) -> Result<CompiledCode, SdkError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            Ok(CompiledCode { code: vec![0xC3], entry_offset: 0, relocations: vec![] })
        }
        fn name(&self) -> &str {
            "counting"
        }
    }
    struct NullSymbols;
    impl NamedSymbolResolver for NullSymbols {
        fn resolve(&self, _s: NamedSymbol) -> u64 {
            0
        }
    }
    struct NullThunks;
    impl ThunkHandler for NullThunks {
        fn lookup_thunk(&self, _s: u64) -> Option<usize> {
            None
        }
    }
    struct NullPauseDelivery;
    impl PauseDelivery for NullPauseDelivery {
        fn notify(&self, _tid: u32, _reason: dbt_sdk::SignalReason) {}
    }

    fn make_context() -> Context<NullBuilder, CountingBackend, StubDispatcher<ScriptedProgram>> {
        Context::new(
            Config::default(),
            Arc::new(CountingBackend { compiles: AtomicUsize::new(0) }),
            Arc::new(StubDispatcher::new(ScriptedProgram::new([
                (GuestRip(0x400000), DispatchStep::Exit(ExitReason::Shutdown)),
            ]))),
            Arc::new(OneInstrDecoder),
            Arc::new(NullPassManager),
            Arc::new(NullSyscallHandler),
            Arc::new(NullSymbols),
            Arc::new(NullThunks),
            Arc::new(NullPauseDelivery),
            Box::new(|| NullBuilder),
        )
    }

    #[test]
    fn init_core_then_compile_block_hits_cache_on_second_call() {
        let ctx = make_context();
        let thread = ctx.init_core(GuestRip(0x400000), 0x7fff_0000);
        let p1 = ctx.compile_block(&thread, GuestRip(0x400000)).unwrap();
        let p2 = ctx.compile_block(&thread, GuestRip(0x400000)).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(ctx.get_thread_count(), 1);
    }

    #[test]
    fn run_until_exit_stops_at_shutdown() {
        let ctx = make_context();
        let thread = ctx.init_core(GuestRip(0x400000), 0);
        let reason = ctx.run_until_exit(&thread);
        assert_eq!(reason, ExitReason::Shutdown);
        assert!(!thread.running.load(Ordering::SeqCst));
    }

    #[test]
    fn custom_ir_entrypoint_is_invoked_instead_of_decoder() {
        let ctx = make_context();
        let thread = ctx.init_core(GuestRip(0x400000), 0);
        let invoked = Arc::new(AtomicUsize::new(0));
        let flag = invoked.clone();
        ctx.add_custom_ir_entrypoint(GuestRip(0x430000), Box::new(move |_| {
            flag.fetch_add(1, Ordering::SeqCst);
        })).unwrap();

        let _ = ctx.compile_block(&thread, GuestRip(0x430000)).unwrap();
        assert_eq!(invoked.load(Ordering::SeqCst), 1);

        ctx.remove_custom_ir_entrypoint(GuestRip(0x430000));
        assert!(!ctx.custom_ir.contains(GuestRip(0x430000)));
        assert!(ctx.find_host_code_for_rip(&thread, GuestRip(0x430000)).is_null());
    }

    #[test]
    fn invalidate_range_evicts_but_preserves_others() {
        let ctx = make_context();
        let thread = ctx.init_core(GuestRip(0x400000), 0);
        ctx.compile_block(&thread, GuestRip(0x402000)).unwrap();
        ctx.compile_block(&thread, GuestRip(0x403000)).unwrap();

        let evicted = ctx.invalidate_guest_code_range(0x402000, 0x10, None);
        assert_eq!(evicted, vec![GuestRip(0x402000)]);
        assert!(ctx.find_host_code_for_rip(&thread, GuestRip(0x402000)).is_null());
        assert!(!ctx.find_host_code_for_rip(&thread, GuestRip(0x403000)).is_null());
    }

    #[test]
    fn mark_memory_shared_is_one_way_and_clears_single_thread() {
        let mut config = Config::default();
        config.tso_auto_migration = true;
        let ctx = Context::new(
            config,
            Arc::new(CountingBackend { compiles: AtomicUsize::new(0) }),
            Arc::new(StubDispatcher::new(ScriptedProgram::new([]))),
            Arc::new(OneInstrDecoder),
            Arc::new(NullPassManager),
            Arc::new(NullSyscallHandler),
            Arc::new(NullSymbols),
            Arc::new(NullThunks),
            Arc::new(NullPauseDelivery),
            Box::new(|| NullBuilder),
        );
        let thread = ctx.init_core(GuestRip(0x400000), 0);
        ctx.compile_block(&thread, GuestRip(0x402000)).unwrap();
        assert!(!ctx.find_host_code_for_rip(&thread, GuestRip(0x402000)).is_null());

        ctx.mark_memory_shared();
        assert!(ctx.find_host_code_for_rip(&thread, GuestRip(0x402000)).is_null());

        // Second call is a no-op even if more threads now exist.
        ctx.compile_block(&thread, GuestRip(0x402000)).unwrap();
        ctx.spawn_guest_thread(&thread);
        ctx.mark_memory_shared();
        assert!(!ctx.find_host_code_for_rip(&thread, GuestRip(0x402000)).is_null());
    }

    #[test]
    fn get_thread_count_and_stats_reflect_spawned_threads() {
        let ctx = make_context();
        let parent = ctx.init_core(GuestRip(0x400000), 0);
        ctx.compile_block(&parent, GuestRip(0x400000)).unwrap();
        ctx.spawn_guest_thread(&parent);
        assert_eq!(ctx.get_thread_count(), 2);
        let snap = ctx.get_runtime_stats_for_thread(0).unwrap();
        assert_eq!(snap.blocks_compiled, 1);
        assert!(ctx.get_runtime_stats_for_thread(99).is_none());
    }
}
