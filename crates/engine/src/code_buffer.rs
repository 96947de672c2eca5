//! A minimal append-only executable-code buffer shared by every thread in a
//! `Context`, standing in for the real mmap'd executable heap the original
//! collaborator's backend manages. Threads share one buffer because, in the
//! original process, compiled code lives in one shared address space and a
//! pointer compiled by one guest thread is valid for every other guest
//! thread to jump to -- that's what makes peer-thread lookup-cache import
//! (C5 step 2) sound.
//!
//! `ClearCodeCache` resets the cursor and bumps a generation counter rather
//! than freeing memory; [`dbt_sdk::HostCodePtr`] embeds the generation it
//! was allocated under so a stale pointer from a previous generation is
//! distinguishable even though the byte offset might coincidentally still
//! be in range.

use dbt_sdk::HostCodePtr;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

struct Inner {
    bytes: Vec<u8>,
    cursor: usize,
}

/// Shared append-only code storage with wholesale-clear semantics.
pub struct CodeBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
    generation: AtomicU64,
}

impl CodeBuffer {
    /// Construct a buffer that holds at most `capacity` bytes before a
    /// caller must clear it.
    pub fn new(capacity: usize) -> Self {
        CodeBuffer {
            inner: Mutex::new(Inner { bytes: vec![0; capacity], cursor: 0 }),
            capacity,
            generation: AtomicU64::new(1),
        }
    }

    /// Append `code`, returning a pointer tagged with the buffer's current
    /// generation, or `None` if it doesn't fit (caller must `clear` and
    /// retry).
    pub fn allocate(&self, code: &[u8]) -> Option<HostCodePtr> {
        let mut inner = self.inner.lock();
        if inner.cursor + code.len() > self.capacity {
            return None;
        }
        let offset = inner.cursor;
        inner.bytes[offset..offset + code.len()].copy_from_slice(code);
        inner.cursor += code.len();
        Some(HostCodePtr::new(offset, self.generation.load(Ordering::Acquire)))
    }

    /// Read back the bytes at a previously allocated pointer, if its
    /// generation is still current.
    pub fn read(&self, ptr: HostCodePtr, len: usize) -> Option<Vec<u8>> {
        if ptr.generation() != self.generation.load(Ordering::Acquire) {
            return None;
        }
        let inner = self.inner.lock();
        let start = ptr.addr();
        if start + len > inner.bytes.len() {
            return None;
        }
        Some(inner.bytes[start..start + len].to_vec())
    }

    /// Reset the cursor to zero and bump the generation, invalidating every
    /// previously issued pointer.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.cursor = 0;
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Bytes used so far.
    pub fn used(&self) -> usize {
        self.inner.lock().cursor
    }

    /// Current generation counter.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}
