//! C9 — ThreadSupervisor: the thread lifecycle state machine and its
//! quiescence primitive.
//!
//! Grounded on `Core.cpp`'s `Context::Pause`/`Run`/`Stop`/`Step` and the
//! `IdleWaitRefCount` + condition variable pattern in
//! `Context::WaitForIdle`/`Context::WaitForIdleWithTimeout`: a 1500ms
//! deadline before re-issuing the pause notification to threads that
//! haven't observed it. Fork cleanup mirrors `CleanupAfterFork`, with the
//! leak the original documents replaced by ordinary `Arc` drop (see
//! DESIGN.md's open question resolution).

use crate::error::SupervisorError;
use crate::thread_state::{ThreadId, ThreadState};
use dbt_sdk::{CodegenBackend, DispatchBuilder, PauseDelivery, SignalReason};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long `wait_for_idle` waits before re-sending the pause notification.
const IDLE_WAIT_ESCALATION: Duration = Duration::from_millis(1500);

/// Lifecycle state of one guest thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadLifecycle {
    /// `ThreadState` exists but the execution thread hasn't been spawned.
    Created,
    /// Execution thread spawned, parked until the first `Run`.
    WaitingToStart,
    /// Actively translating and executing guest code.
    Running,
    /// Parked after observing a `Pause` signal.
    Paused,
    /// Told to stop; will transition to `Destroyed` once it observes this.
    Stopping,
    /// Torn down; no longer tracked.
    Destroyed,
}

/// Reference-counted idle gate: every running thread holds one count while
/// it is not blocked waiting for work, and `wait_for_idle` blocks until the
/// count reaches zero.
///
/// Grounded on `Core.cpp`'s `IdleWaitRefCount`/`IdleWaitCV` pair; modeled
/// here with `parking_lot::Condvar` instead of a raw futex.
pub struct IdleWaitGate {
    count: Mutex<i64>,
    cv: Condvar,
}

impl Default for IdleWaitGate {
    fn default() -> Self {
        IdleWaitGate { count: Mutex::new(0), cv: Condvar::new() }
    }
}

impl IdleWaitGate {
    /// Construct an empty gate (no threads currently active).
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark one thread as newly active (about to run guest code).
    pub fn enter(&self) {
        let mut count = self.count.lock();
        *count += 1;
    }

    /// Mark one thread as idle; wakes any waiter if this was the last one.
    pub fn leave(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count <= 0 {
            self.cv.notify_all();
        }
    }

    /// Block until the active count reaches zero.
    pub fn wait_for_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cv.wait(&mut count);
        }
    }

    /// Block until idle or `timeout` elapses; returns whether it went idle.
    pub fn wait_for_idle_with_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        if *count <= 0 {
            return true;
        }
        let result = self.cv.wait_for(&mut count, timeout);
        !result.timed_out() && *count <= 0
    }

    /// Current active count, for diagnostics.
    pub fn active_count(&self) -> i64 {
        *self.count.lock()
    }
}

/// Drives pause/run/stop/step transitions across every thread tracked by a
/// context, using a [`PauseDelivery`] collaborator instead of a raw signal.
pub struct ThreadSupervisor {
    idle_gate: IdleWaitGate,
    pause_delivery: Arc<dyn PauseDelivery>,
    generation: AtomicI64,
}

impl ThreadSupervisor {
    /// Construct a supervisor bound to a concrete pause-delivery mechanism.
    pub fn new(pause_delivery: Arc<dyn PauseDelivery>) -> Self {
        ThreadSupervisor { idle_gate: IdleWaitGate::new(), pause_delivery, generation: AtomicI64::new(0) }
    }

    /// Direct access to the idle gate, e.g. for an execution loop to call
    /// `enter`/`leave` around its run span.
    pub fn idle_gate(&self) -> &IdleWaitGate {
        &self.idle_gate
    }

    /// Request every running thread to pause at its next safepoint, then
    /// wait for them to go idle, escalating (re-sending the notification)
    /// every 1500ms until they do.
    pub fn pause_all<D, C>(&self, threads: &[Arc<ThreadState<D, C>>])
    where
        D: DispatchBuilder,
        C: CodegenBackend<Ir = D::Ir, RegisterAllocationData = D::RegisterAllocationData>,
    {
        self.generation.fetch_add(1, Ordering::AcqRel);
        for thread in threads {
            if thread.running.load(Ordering::Acquire) {
                *thread.signal_reason.lock() = SignalReason::Pause;
                self.pause_delivery.notify(thread.tid.load(Ordering::Acquire), SignalReason::Pause);
            }
        }

        while !self.idle_gate.wait_for_idle_with_timeout(IDLE_WAIT_ESCALATION) {
            for thread in threads {
                if thread.running.load(Ordering::Acquire) {
                    self.pause_delivery.notify(thread.tid.load(Ordering::Acquire), SignalReason::Pause);
                }
            }
        }
    }

    /// Resume every paused thread.
    pub fn run_all<D, C>(&self, threads: &[Arc<ThreadState<D, C>>])
    where
        D: DispatchBuilder,
        C: CodegenBackend<Ir = D::Ir, RegisterAllocationData = D::RegisterAllocationData>,
    {
        for thread in threads {
            *thread.signal_reason.lock() = SignalReason::Return;
            thread.waiting_to_start.store(false, Ordering::Release);
            thread.signal_start();
            self.pause_delivery.notify(thread.tid.load(Ordering::Acquire), SignalReason::Return);
        }
    }

    /// Request threads to stop. If `ignore_self` names a thread, it is
    /// skipped (the original's "stop every thread but the caller" mode used
    /// when a guest thread calls its own exit-group equivalent).
    pub fn stop_all<D, C>(&self, threads: &[Arc<ThreadState<D, C>>], ignore_self: Option<ThreadId>)
    where
        D: DispatchBuilder,
        C: CodegenBackend<Ir = D::Ir, RegisterAllocationData = D::RegisterAllocationData>,
    {
        for thread in threads {
            if Some(thread.id) == ignore_self {
                continue;
            }
            *thread.signal_reason.lock() = SignalReason::Stop;
            if thread.running.load(Ordering::Acquire) {
                self.pause_delivery.notify(thread.tid.load(Ordering::Acquire), SignalReason::Stop);
            } else {
                thread.waiting_to_start.store(false, Ordering::Release);
            }
            thread.signal_start();
        }
        self.idle_gate.wait_for_idle();
    }

    /// Single-step every thread exactly one guest instruction: pause, clear
    /// every thread's code cache so the next compile is forced to emit a
    /// one-instruction block, let them run to the next idle point, then
    /// return control to the caller (who is responsible for restoring
    /// `Config::running_mode` and `max_inst_per_block` and, if desired,
    /// rebuilding the normal-size blocks afterward).
    pub fn step<D, C>(&self, threads: &[Arc<ThreadState<D, C>>])
    where
        D: DispatchBuilder,
        C: CodegenBackend<Ir = D::Ir, RegisterAllocationData = D::RegisterAllocationData>,
    {
        self.pause_all(threads);
        for thread in threads {
            thread.clear_code_cache();
            thread.stats.record_cache_clear();
        }
        self.run_all(threads);
        self.idle_gate.wait_for_idle();
    }

    /// Drop every `ThreadState` that is not `survivor` (the thread that
    /// called `fork`), matching the original's single-surviving-thread
    /// post-fork contract. Unlike the original, which intentionally leaks
    /// the non-surviving threads' allocations because the forked child's
    /// allocator state is unsafe to touch, this drops the `Arc`s: Rust's
    /// ownership model lets the drop run safely here because nothing in the
    /// forked child ever re-enters those threads' native TLS or mutex
    /// state, so there is nothing unsafe left to avoid.
    pub fn cleanup_after_fork<D, C>(threads: Vec<Arc<ThreadState<D, C>>>, survivor: ThreadId) -> Vec<Arc<ThreadState<D, C>>>
    where
        D: DispatchBuilder,
        C: CodegenBackend<Ir = D::Ir, RegisterAllocationData = D::RegisterAllocationData>,
    {
        threads.into_iter().filter(|t| t.id == survivor).collect()
    }

    /// Validate that `rip` doesn't exceed 32 bits when the guest is
    /// configured for 32-bit mode, returning the violation as a typed error
    /// rather than silently truncating.
    pub fn check_address_width(rip: dbt_sdk::GuestRip, is_64bit_mode: bool) -> Result<(), SupervisorError> {
        if !is_64bit_mode && !rip.fits_32() {
            return Err(SupervisorError::AddressWidthViolation(rip));
        }
        Ok(())
    }
}

#[cfg(unix)]
static RESERVED_PAUSE_SIGNAL: once_cell::sync::OnceCell<libc::c_int> = once_cell::sync::OnceCell::new();

/// Publish the signal number the core reserves for pause/stop delivery, once
/// per process. Matches the original's "the core reserves one signal number
/// from the signal delegator and publishes it at init" contract: later
/// callers (e.g. a signal delegator chaining a prior handler) read back
/// whatever was reserved first rather than each picking their own.
#[cfg(unix)]
pub fn reserve_pause_signal(signal: libc::c_int) -> libc::c_int {
    *RESERVED_PAUSE_SIGNAL.get_or_init(|| signal)
}

#[cfg(unix)]
/// `PauseDelivery` backed by `tgkill`, targeting a specific OS thread with a
/// real-time signal the dispatcher's safepoint checks for.
pub struct PosixPauseDelivery {
    pid: libc::pid_t,
    signal: libc::c_int,
}

#[cfg(unix)]
impl PosixPauseDelivery {
    /// Bind delivery to the calling process and reserve `signal` process-wide
    /// (the embedder is expected to have installed a handler for it that
    /// does nothing but set a safepoint flag).
    pub fn new(signal: libc::c_int) -> Self {
        PosixPauseDelivery { pid: unsafe { libc::getpid() }, signal: reserve_pause_signal(signal) }
    }
}

#[cfg(unix)]
impl PauseDelivery for PosixPauseDelivery {
    fn notify(&self, tid: u32, _reason: SignalReason) {
        if tid == 0 {
            return;
        }
        unsafe {
            libc::syscall(libc::SYS_tgkill, self.pid, tid as libc::pid_t, self.signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CodePageIndex;
    use crate::code_buffer::CodeBuffer;
    use crate::custom_ir::CustomIrHandlers;
    use crate::pipeline::CompilationPipeline;
    use dbt_sdk::{
        CompiledCode, CpuState, DecodedInstruction, DispatchOutcome, FrontendDecoder, GuestRip,
        PassManager, SdkError, SyscallHandler,
    };
    use std::sync::Mutex as StdMutex;

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
            (UnitIr, 0, 0)
        }
    }
    struct NullDecoder;
    impl FrontendDecoder for NullDecoder {
        fn decode_instructions_at_entry(
            &self,
            _e: GuestRip,
            _m: bool,
            _cb: &mut dbt_sdk::BlockCallback<'_>,
        ) -> Result<Vec<DecodedInstruction>, SdkError> {
            Ok(vec![])
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
    struct NullBackend;
    impl CodegenBackend for NullBackend {
        type Ir = UnitIr;
        type RegisterAllocationData = ();
        fn compile_code(&self, _r: GuestRip, _ir: &Self::Ir, _ra: Option<&()>) -> Result<CompiledCode, SdkError> {
            Ok(CompiledCode { code: vec![], entry_offset: 0, relocations: vec![] })
        }
        fn name(&self) -> &str {
            "null"
        }
    }

    fn make_thread(id: u64) -> Arc<ThreadState<NullBuilder, NullBackend>> {
        let pipeline = CompilationPipeline::new(
            NullBuilder,
            Arc::new(NullDecoder),
            Arc::new(NullPassManager),
            Arc::new(NullSyscallHandler),
            Arc::new(CodePageIndex::new()),
            Arc::new(CustomIrHandlers::new()),
            None,
        );
        Arc::new(ThreadState::new(
            ThreadId(id),
            None,
            CpuState::default_for_new_thread(),
            pipeline,
            Arc::new(NullBackend),
            Arc::new(CodeBuffer::new(4096)),
        ))
    }

    struct RecordingPauseDelivery {
        calls: StdMutex<Vec<(u32, SignalReason)>>,
    }
    impl PauseDelivery for RecordingPauseDelivery {
        fn notify(&self, tid: u32, reason: SignalReason) {
            self.calls.lock().unwrap().push((tid, reason));
        }
    }

    #[test]
    fn idle_gate_reports_idle_when_nothing_entered() {
        let gate = IdleWaitGate::new();
        assert!(gate.wait_for_idle_with_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn idle_gate_blocks_until_leave() {
        let gate = IdleWaitGate::new();
        gate.enter();
        assert!(!gate.wait_for_idle_with_timeout(Duration::from_millis(10)));
        gate.leave();
        assert!(gate.wait_for_idle_with_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn pause_all_only_notifies_running_threads() {
        let delivery = Arc::new(RecordingPauseDelivery { calls: StdMutex::new(Vec::new()) });
        let supervisor = ThreadSupervisor::new(delivery.clone());
        let t1 = make_thread(1);
        let t2 = make_thread(2);
        t1.running.store(true, Ordering::SeqCst);
        t1.tid.store(111, Ordering::SeqCst);

        supervisor.pause_all(&[t1.clone(), t2.clone()]);

        let calls = delivery.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (111, SignalReason::Pause));
        assert_eq!(*t1.signal_reason.lock(), SignalReason::Pause);
    }

    #[test]
    fn cleanup_after_fork_keeps_only_survivor() {
        let t1 = make_thread(1);
        let t2 = make_thread(2);
        let t3 = make_thread(3);
        let survivors = ThreadSupervisor::cleanup_after_fork(vec![t1, t2.clone(), t3], ThreadId(2));
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].id, t2.id);
    }

    #[test]
    fn address_width_violation_is_rejected_in_32bit_mode() {
        assert!(ThreadSupervisor::check_address_width(GuestRip(0x1_0000_0000), false).is_err());
        assert!(ThreadSupervisor::check_address_width(GuestRip(0x1000), false).is_ok());
        assert!(ThreadSupervisor::check_address_width(GuestRip(0x1_0000_0000), true).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn reserved_pause_signal_is_stable_across_calls() {
        let first = reserve_pause_signal(libc::SIGRTMIN());
        let second = reserve_pause_signal(libc::SIGRTMIN() + 5);
        assert_eq!(first, second);
    }
}
