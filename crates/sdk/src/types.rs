//! Core value types shared between the engine and its collaborators.

use std::fmt;

/// A guest instruction address.
///
/// In 32-bit guest mode the upper 32 bits must be zero; callers that violate
/// this should treat it as a programming error, not a recoverable one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestRip(pub u64);

impl GuestRip {
    /// The page number (`rip >> 12`) this address falls on.
    pub fn page(self) -> u64 {
        self.0 >> 12
    }

    /// Whether this address fits in 32 bits, as required outside 64-bit mode.
    pub fn fits_32(self) -> bool {
        self.0 <= u32::MAX as u64
    }
}

impl fmt::Debug for GuestRip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GuestRip({:#018x})", self.0)
    }
}

impl From<u64> for GuestRip {
    fn from(v: u64) -> Self {
        GuestRip(v)
    }
}

/// Opaque pointer into a thread's executable code buffer.
///
/// Stable for the lifetime of the buffer generation it was allocated in; not
/// an owning pointer. Callers must not dereference it outside the owning
/// thread's code buffer lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostCodePtr {
    addr: usize,
    /// Buffer generation this pointer was produced in; bumped on every
    /// `ClearCodeCache`. A stale generation means the pointer must not be
    /// dereferenced even though the bit pattern is still around.
    generation: u64,
}

impl HostCodePtr {
    /// Construct a pointer from a raw address and the buffer generation that
    /// produced it.
    pub fn new(addr: usize, generation: u64) -> Self {
        HostCodePtr { addr, generation }
    }

    /// Null sentinel meaning "no compiled code". Every real buffer starts at
    /// generation 1 and only ever counts up, so generation 0 is reserved and
    /// never collides with a valid allocation -- including one at `addr 0`,
    /// the first allocation into a fresh or just-cleared buffer.
    pub const NULL: HostCodePtr = HostCodePtr { addr: 0, generation: 0 };

    /// Whether this is the null sentinel.
    pub fn is_null(self) -> bool {
        self.generation == 0
    }

    /// Raw address, for handing to a dispatcher trampoline.
    pub fn addr(self) -> usize {
        self.addr
    }

    /// The buffer generation this pointer belongs to.
    pub fn generation(self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for HostCodePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostCodePtr({:#x}@gen{})", self.addr, self.generation)
    }
}

/// Selects which backend the core compiles through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreMode {
    /// Pure bytecode interpreter, no codegen.
    Interpreter,
    /// IR-based JIT.
    IrJit,
    /// Embedder-supplied backend, chosen outside this crate.
    Custom,
}

/// SMC detection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmcChecks {
    /// No self-modifying-code protection at all.
    None,
    /// Rely on page write-trap notifications only (no per-block guard).
    MTrack,
    /// Emit a guard sequence at the top of every compiled block.
    Full,
}

/// Whether a thread is running at normal speed or single-stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningMode {
    /// Normal execution.
    Run,
    /// Single instruction per block, used by `Step`.
    SingleStep,
}

/// Where IR text dumps are written, if at all.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DumpIr {
    /// Don't dump.
    #[default]
    No,
    /// Write to stderr.
    Stderr,
    /// Write to stdout.
    Stdout,
    /// Write one file per block under this directory.
    Dir(std::path::PathBuf),
}

/// Object-code cache mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectCacheMode {
    /// Disabled.
    #[default]
    None,
    /// Serve lookups from a prior run's cache; never write new entries.
    Read,
    /// Serve lookups and persist newly compiled blocks.
    ReadWrite,
}

/// Embedder-assembled configuration.
///
/// This is a plain struct with a `Default` impl, not a CLI/file parser —
/// parsing configuration sources is outside this crate's concerns.
#[derive(Debug, Clone)]
pub struct Config {
    /// Which backend family to compile through.
    pub core: CoreMode,
    /// Whether to start a GDB-protocol debug server.
    pub gdb_server: bool,
    /// Whether the frontend may decode multiple blocks per compile.
    pub multiblock: bool,
    /// Whether to request static register allocation (ANDed with backend
    /// capability by the pass manager).
    pub static_register_allocation: bool,
    /// Self-modifying-code detection strategy.
    pub smc_checks: SmcChecks,
    /// Maximum guest instructions translated per block.
    pub max_inst_per_block: u32,
    /// Normal run vs. single-step.
    pub running_mode: RunningMode,
    /// IR text-dump destination.
    pub dump_ir: DumpIr,
    /// On-disk object cache mode.
    pub cache_object_code_compilation: ObjectCacheMode,
    /// Whether to register compiled blocks with the symbol registrar.
    pub block_jit_naming: bool,
    /// Whether the guest runs in 64-bit mode.
    pub is_64bit_mode: bool,
    /// Automatically migrate to TSO-shared-memory mode on `MarkMemoryShared`.
    pub tso_auto_migration: bool,
    /// Round-trip every compiled IR through its text parser for self-validation.
    pub validate_ir_parser: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            core: CoreMode::IrJit,
            gdb_server: false,
            multiblock: true,
            static_register_allocation: true,
            smc_checks: SmcChecks::MTrack,
            max_inst_per_block: 5000,
            running_mode: RunningMode::Run,
            dump_ir: DumpIr::No,
            cache_object_code_compilation: ObjectCacheMode::None,
            block_jit_naming: false,
            is_64bit_mode: true,
            tso_auto_migration: false,
            validate_ir_parser: false,
        }
    }
}

/// Reason the core handed control back to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Thread is parked, waiting for `Run`.
    Waiting,
    /// No particular reason; transient.
    None,
    /// An async callback is in flight.
    AsyncRun,
    /// Thread suspended itself (e.g. via a guest syscall).
    Suspend,
    /// The whole core is shutting down.
    Shutdown,
    /// A debug event fired (breakpoint, single-step landed).
    Debug,
    /// Unrecoverable error.
    UnknownError,
}

/// What a thread-directed signal is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalReason {
    /// No pending signal.
    None,
    /// Pause at the next safepoint.
    Pause,
    /// Stop (terminate) at the next safepoint.
    Stop,
    /// Resume from a pause.
    Return,
}

/// Minimal guest CPU register file the core initializes and hands to the
/// dispatcher. Field set mirrors what the original collaborator's default
/// state construction actually touches, not a full x86-64 register dump.
#[derive(Debug, Clone, Copy)]
pub struct CpuState {
    /// Guest instruction pointer.
    pub rip: u64,
    /// General purpose registers, r0..r15 (rsp is gregs\[4\] by x86-64 ABI
    /// convention but is intentionally not special-cased here).
    pub gregs: [u64; 16],
    /// Vector registers, low/high 64-bit halves.
    pub xmm: [[u64; 2]; 16],
    /// Bitwise guest flags.
    pub flags: [u8; 48],
    /// x87 control word.
    pub fcw: u16,
    /// x87 tag word.
    pub ftw: u16,
}

impl CpuState {
    /// The default state the embedding API's `InitCore` installs for a new
    /// thread: RIP set to the all-ones sentinel (no code yet), vector lanes
    /// poisoned with a recognizable pattern for debugging, flags' reserved
    /// bits 1 and 9 set as the x86-64 architecture requires, and the FPU
    /// control/tag words set to their power-on values.
    pub fn default_for_new_thread() -> Self {
        let mut xmm = [[0u64; 2]; 16];
        for lane in xmm.iter_mut() {
            *lane = [0xDEADBEEFu64, 0xBAD0DAD1u64];
        }
        let mut flags = [0u8; 48];
        flags[1] = 1;
        flags[9] = 1;
        CpuState {
            rip: u64::MAX,
            gregs: [0; 16],
            xmm,
            flags,
            fcw: 0x37F,
            ftw: 0xFFFF,
        }
    }
}
