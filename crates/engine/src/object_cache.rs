//! C7 — ObjectCacheService: asynchronous, reference-counted persistence of
//! compiled code fragments across process runs.
//!
//! The job queue and ref-counted drain are grounded on the pattern used
//! throughout `raya-engine`'s scheduler for background work (a dedicated
//! worker thread draining a `crossbeam::channel`); the on-disk record
//! layout is grounded on `raya-runtime/src/bundle/format.rs`'s hand-rolled
//! `#[repr(C, packed)]` trailer with a magic, a version, and a `crc32fast`
//! checksum -- this engine is not part of that bundle format, but imitates
//! its "small hand-rolled binary layout, not a general serialization crate"
//! approach for the same reason: the cache is host-specific and read back
//! only by this engine.

use crate::error::ObjectCacheError;
use dbt_sdk::{GuestRip, NamedSymbol, ObjectCacheMode, Relocation};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAGIC: [u8; 8] = *b"DBTOCAC\0";
const FORMAT_VERSION: u32 = 1;

/// A compiled fragment as persisted to / served from the cache.
#[derive(Debug, Clone)]
pub struct CachedFragment {
    /// Host machine code bytes, relative to the block's entry point.
    pub code: Vec<u8>,
    /// Relocations that must be re-applied on every materialization.
    pub relocations: Vec<Relocation>,
    /// Guest byte length of the block this fragment came from, needed to
    /// re-register the block's extent in a fresh process's page index.
    pub guest_code_length: u64,
}

/// A freshly compiled block handed to the service for asynchronous
/// persistence.
pub struct SerializationJob {
    /// Guest entry RIP.
    pub rip: GuestRip,
    /// Guest byte length of the compiled block.
    pub guest_code_length: u64,
    /// Host code bytes.
    pub host_code: Vec<u8>,
    /// Relocations accompanying the code.
    pub relocations: Vec<Relocation>,
    /// Decremented once this job has been durably recorded; shared with the
    /// owning thread so it can wait for drain before clearing its cache.
    pub thread_ref_count: Arc<AtomicU64>,
}

enum WorkerMsg {
    Job(SerializationJob),
    Shutdown,
}

/// Background service coordinating in-memory and (optionally) on-disk
/// object code caching.
pub struct ObjectCacheService {
    entries: Arc<RwLock<FxHashMap<GuestRip, CachedFragment>>>,
    sender: crossbeam::channel::Sender<WorkerMsg>,
    worker: Option<JoinHandle<()>>,
    mode: ObjectCacheMode,
}

impl ObjectCacheService {
    /// Construct the service. If `mode` is `Read` or `ReadWrite` and
    /// `cache_path` names an existing, valid file, its entries are loaded
    /// eagerly; a missing or corrupt file is treated as an empty cache, not
    /// an error.
    pub fn new(mode: ObjectCacheMode, cache_path: Option<PathBuf>) -> Self {
        let mut initial = FxHashMap::default();
        if mode != ObjectCacheMode::None {
            if let Some(path) = &cache_path {
                match load_cache_file(path) {
                    Ok(loaded) => initial = loaded,
                    Err(e) => log::warn!("object cache file failed validation, starting empty: {e}"),
                }
            }
        }

        let entries = Arc::new(RwLock::new(initial));
        let (sender, receiver) = crossbeam::channel::unbounded::<WorkerMsg>();
        let worker_entries = entries.clone();
        let worker_path = cache_path.clone();
        let worker_mode = mode;

        let worker = std::thread::Builder::new()
            .name("dbt-object-cache".into())
            .spawn(move || {
                run_worker(receiver, worker_entries, worker_path, worker_mode);
            })
            .expect("failed to spawn object cache worker thread");

        ObjectCacheService { entries, sender, worker: Some(worker), mode }
    }

    /// Look up a previously compiled (or loaded) fragment for `rip`.
    pub fn fetch(&self, rip: GuestRip) -> Option<CachedFragment> {
        self.entries.read().get(&rip).cloned()
    }

    /// Enqueue `job` for asynchronous persistence. No-op if the service was
    /// constructed with `ObjectCacheMode::None`.
    pub fn async_add_serialization_job(&self, job: SerializationJob) {
        if self.mode == ObjectCacheMode::None {
            return;
        }
        job.thread_ref_count.fetch_add(1, Ordering::AcqRel);
        let _ = self.sender.send(WorkerMsg::Job(job));
    }

    /// Block until `ref_count` reaches zero, polling at a short interval.
    /// Used before `ClearCodeCache` and during thread teardown to avoid a
    /// dangling reference to code about to be freed.
    pub fn wait_for_empty_job_queue(&self, ref_count: &AtomicU64) {
        while ref_count.load(Ordering::Acquire) != 0 {
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    /// Whether the service was configured to do anything at all.
    pub fn is_enabled(&self) -> bool {
        self.mode != ObjectCacheMode::None
    }

    /// Drain the job queue and join the worker thread.
    pub fn shutdown(&mut self) {
        let _ = self.sender.send(WorkerMsg::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ObjectCacheService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    receiver: crossbeam::channel::Receiver<WorkerMsg>,
    entries: Arc<RwLock<FxHashMap<GuestRip, CachedFragment>>>,
    cache_path: Option<PathBuf>,
    mode: ObjectCacheMode,
) {
    let mut dirty = false;
    loop {
        match receiver.recv() {
            Ok(WorkerMsg::Job(job)) => {
                if mode == ObjectCacheMode::ReadWrite {
                    entries.write().insert(
                        job.rip,
                        CachedFragment {
                            code: job.host_code,
                            relocations: job.relocations,
                            guest_code_length: job.guest_code_length,
                        },
                    );
                    dirty = true;
                }
                job.thread_ref_count.fetch_sub(1, Ordering::AcqRel);
            }
            Ok(WorkerMsg::Shutdown) | Err(_) => break,
        }
    }
    if dirty && mode == ObjectCacheMode::ReadWrite {
        if let Some(path) = cache_path {
            let snapshot = entries.read().clone();
            if let Err(e) = save_cache_file(&path, &snapshot) {
                log::warn!("failed to persist object cache to {}: {e}", path.display());
            }
        }
    }
}

/// Resolve the default on-disk cache directory for a given `tag` (e.g. a
/// per-executable or per-session identifier), following the same `dirs`-crate
/// convention `raya-engine` uses for locating its own package cache.
pub fn default_cache_path(tag: &str) -> Option<PathBuf> {
    dirs::cache_dir().map(|mut dir| {
        dir.push("dbt-engine");
        dir.push(format!("{tag}.objcache"));
        dir
    })
}

fn reloc_tag(r: &Relocation) -> u8 {
    match r {
        Relocation::NamedSymbolLiteral { .. } => 0,
        Relocation::GuestRipLiteral { .. } => 1,
        Relocation::NamedThunkMove { .. } => 2,
        Relocation::GuestRipMove { .. } => 3,
    }
}

fn encode_relocation(buf: &mut Vec<u8>, r: &Relocation) {
    buf.push(reloc_tag(r));
    buf.extend_from_slice(&r.offset().to_le_bytes());
    match r {
        Relocation::NamedSymbolLiteral { symbol, .. } => {
            let sym_id: u8 = match symbol {
                NamedSymbol::ExitFunctionLinker => 0,
            };
            buf.push(sym_id);
        }
        Relocation::GuestRipLiteral { guest_entry_offset, .. } => {
            buf.extend_from_slice(&guest_entry_offset.to_le_bytes());
        }
        Relocation::NamedThunkMove { symbol, register, .. } => {
            buf.extend_from_slice(&symbol.to_le_bytes());
            buf.push(*register);
        }
        Relocation::GuestRipMove { guest_entry_offset, register, .. } => {
            buf.extend_from_slice(&guest_entry_offset.to_le_bytes());
            buf.push(*register);
        }
    }
}

fn decode_relocation(cursor: &mut &[u8]) -> Result<Relocation, ObjectCacheError> {
    let tag = take_u8(cursor)?;
    let offset = u32::from_le_bytes(take_n::<4>(cursor)?);
    Ok(match tag {
        0 => {
            let sym_id = take_u8(cursor)?;
            let symbol = match sym_id {
                0 => NamedSymbol::ExitFunctionLinker,
                _ => return Err(ObjectCacheError::Corrupt("unknown named symbol id".into())),
            };
            Relocation::NamedSymbolLiteral { offset, symbol }
        }
        1 => {
            let guest_entry_offset = i64::from_le_bytes(take_n::<8>(cursor)?);
            Relocation::GuestRipLiteral { offset, guest_entry_offset }
        }
        2 => {
            let symbol = u64::from_le_bytes(take_n::<8>(cursor)?);
            let register = take_u8(cursor)?;
            Relocation::NamedThunkMove { offset, symbol, register }
        }
        3 => {
            let guest_entry_offset = i64::from_le_bytes(take_n::<8>(cursor)?);
            let register = take_u8(cursor)?;
            Relocation::GuestRipMove { offset, guest_entry_offset, register }
        }
        _ => return Err(ObjectCacheError::Corrupt("unknown relocation tag".into())),
    })
}

fn take_u8(cursor: &mut &[u8]) -> Result<u8, ObjectCacheError> {
    if cursor.is_empty() {
        return Err(ObjectCacheError::Corrupt("unexpected end of cache file".into()));
    }
    let b = cursor[0];
    *cursor = &cursor[1..];
    Ok(b)
}

fn take_n<const N: usize>(cursor: &mut &[u8]) -> Result<[u8; N], ObjectCacheError> {
    if cursor.len() < N {
        return Err(ObjectCacheError::Corrupt("unexpected end of cache file".into()));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&cursor[..N]);
    *cursor = &cursor[N..];
    Ok(out)
}

fn take_vec(cursor: &mut &[u8], len: usize) -> Result<Vec<u8>, ObjectCacheError> {
    if cursor.len() < len {
        return Err(ObjectCacheError::Corrupt("unexpected end of cache file".into()));
    }
    let out = cursor[..len].to_vec();
    *cursor = &cursor[len..];
    Ok(out)
}

fn encode_cache_file(entries: &FxHashMap<GuestRip, CachedFragment>) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    payload.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (rip, fragment) in entries {
        payload.extend_from_slice(&rip.0.to_le_bytes());
        payload.extend_from_slice(&fragment.guest_code_length.to_le_bytes());
        payload.extend_from_slice(&(fragment.code.len() as u32).to_le_bytes());
        payload.extend_from_slice(&fragment.code);
        payload.extend_from_slice(&(fragment.relocations.len() as u32).to_le_bytes());
        for reloc in &fragment.relocations {
            encode_relocation(&mut payload, reloc);
        }
    }

    let checksum = crc32fast::hash(&payload);
    let mut file = Vec::with_capacity(MAGIC.len() + payload.len() + 4);
    file.extend_from_slice(&MAGIC);
    file.extend_from_slice(&payload);
    file.extend_from_slice(&checksum.to_le_bytes());
    file
}

fn decode_cache_file(data: &[u8]) -> Result<FxHashMap<GuestRip, CachedFragment>, ObjectCacheError> {
    if data.len() < MAGIC.len() + 4 {
        return Err(ObjectCacheError::Corrupt("file too short".into()));
    }
    if data[..MAGIC.len()] != MAGIC {
        return Err(ObjectCacheError::Corrupt("bad magic".into()));
    }
    let payload = &data[MAGIC.len()..data.len() - 4];
    let stored_checksum = u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap());
    if crc32fast::hash(payload) != stored_checksum {
        return Err(ObjectCacheError::Corrupt("checksum mismatch".into()));
    }

    let mut cursor = payload;
    let version = u32::from_le_bytes(take_n::<4>(&mut cursor)?);
    if version != FORMAT_VERSION {
        return Err(ObjectCacheError::Corrupt(format!("unsupported version {version}")));
    }
    let entry_count = u32::from_le_bytes(take_n::<4>(&mut cursor)?);

    let mut out = FxHashMap::default();
    for _ in 0..entry_count {
        let rip = GuestRip(u64::from_le_bytes(take_n::<8>(&mut cursor)?));
        let guest_code_length = u64::from_le_bytes(take_n::<8>(&mut cursor)?);
        let code_len = u32::from_le_bytes(take_n::<4>(&mut cursor)?) as usize;
        let code = take_vec(&mut cursor, code_len)?;
        let reloc_count = u32::from_le_bytes(take_n::<4>(&mut cursor)?);
        let mut relocations = Vec::with_capacity(reloc_count as usize);
        for _ in 0..reloc_count {
            relocations.push(decode_relocation(&mut cursor)?);
        }
        out.insert(rip, CachedFragment { code, relocations, guest_code_length });
    }
    Ok(out)
}

fn load_cache_file(path: &Path) -> Result<FxHashMap<GuestRip, CachedFragment>, ObjectCacheError> {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FxHashMap::default()),
        Err(e) => return Err(ObjectCacheError::Io(e)),
    };
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    decode_cache_file(&data)
}

fn save_cache_file(path: &Path, entries: &FxHashMap<GuestRip, CachedFragment>) -> Result<(), ObjectCacheError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = encode_cache_file(entries);
    let mut file = std::fs::File::create(path)?;
    file.write_all(&bytes)?;
    Ok(())
}
