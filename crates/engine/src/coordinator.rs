//! C5 — CodeCacheCoordinator: serves `CompileBlock(rip)`.
//!
//! Grounded on `Core.cpp`'s `Context::CompileBlock`/`CompileCode`: own-cache
//! lookup, then peer-thread import, then object-cache fetch + relocation,
//! then a full compile through the pipeline and backend, then insertion and
//! an optional asynchronous serialization job.
//!
//! The caller (`Context::compile_block`) is responsible for holding the
//! `CodeInvalidationMutex` in shared mode for the duration of this call; this
//! module assumes that's already true and does not take the lock itself.

use crate::cache::CodePageIndex;
use crate::code_buffer::CodeBuffer;
use crate::error::{CoreError, PipelineError};
use crate::object_cache::{ObjectCacheService, SerializationJob};
use crate::relocation::{NamedSymbolResolver, RelocationEngine};
use crate::thread_state::{DebugData, ThreadState};
use dbt_sdk::{CodegenBackend, Config, DispatchBuilder, GuestRip, HostCodePtr, SymbolRegistrar, ThunkHandler};
use std::sync::Arc;

/// Stateless driver for `CompileBlock`; all mutable state lives in the
/// `Context`/`ThreadState` it's handed.
pub struct CodeCacheCoordinator;

impl CodeCacheCoordinator {
    /// Resolve `rip` to a host code pointer for `thread`, trying (in order)
    /// this thread's cache, every peer thread's cache, the object cache,
    /// and finally a full compile.
    #[allow(clippy::too_many_arguments)]
    pub fn compile_block<D, C>(
        thread: &Arc<ThreadState<D, C>>,
        peers: &[Arc<ThreadState<D, C>>],
        page_index: &CodePageIndex,
        object_cache: &ObjectCacheService,
        symbols: &dyn NamedSymbolResolver,
        thunks: &dyn ThunkHandler,
        symbol_registrar: Option<&dyn SymbolRegistrar>,
        config: &Config,
        rip: GuestRip,
    ) -> Result<HostCodePtr, CoreError>
    where
        D: DispatchBuilder,
        C: CodegenBackend<Ir = D::Ir, RegisterAllocationData = D::RegisterAllocationData>,
    {
        let own = thread.lookup_cache.find_block(rip);
        if !own.is_null() {
            return Ok(own);
        }

        for peer in peers {
            if Arc::ptr_eq(peer, thread) {
                continue;
            }
            let found = peer.lookup_cache.find_block(rip);
            if !found.is_null() {
                thread.lookup_cache.add_block_mapping(rip, found);
                return Ok(found);
            }
        }

        let object_cache_enabled = object_cache.is_enabled();
        if object_cache_enabled {
            if let Some(fragment) = object_cache.fetch(rip) {
                let relocation_engine = RelocationEngine::new(symbols, thunks);
                if let Ok(bytes) = relocation_engine.materialize(rip, &fragment.code, &fragment.relocations) {
                    if let Some(ptr) = Self::allocate_with_retry(&thread.code_buffer, &thread.lookup_cache, object_cache, &thread.object_cache_ref_count, &bytes) {
                        thread.stats.record_object_cache_lookup(true);
                        page_index.add_block_executable_range(rip, rip.0, fragment.guest_code_length.max(1));
                        thread.lookup_cache.add_block_mapping(rip, ptr);
                        return Ok(ptr);
                    }
                }
            }
            thread.stats.record_object_cache_lookup(false);
        }

        let generated = {
            let mut pipeline = thread.pipeline.lock();
            pipeline.generate_ir(rip, config)?
        };

        let compiled = thread
            .backend
            .compile_code(rip, &generated.ir, generated.ra_data.as_ref())
            .map_err(|e| CoreError::from(PipelineError::Backend(e.to_string())))?;

        let ptr = Self::allocate_with_retry(&thread.code_buffer, &thread.lookup_cache, object_cache, &thread.object_cache_ref_count, &compiled.code)
            .ok_or_else(|| CoreError::from(PipelineError::Backend("code buffer exhausted after clear".into())))?;

        thread.lookup_cache.add_block_mapping(rip, ptr);
        thread.record_debug_data(
            rip,
            DebugData { start_addr: generated.start_addr, length: generated.length, instruction_count: generated.total_instructions },
        );
        thread.stats.record_block_compiled(generated.total_instructions);

        if config.block_jit_naming {
            if let Some(registrar) = symbol_registrar {
                registrar.register(ptr.addr(), compiled.code.len(), &format!("jit_{:#x}", rip.0));
            }
        }

        if config.cache_object_code_compilation == dbt_sdk::ObjectCacheMode::ReadWrite {
            object_cache.async_add_serialization_job(SerializationJob {
                rip,
                guest_code_length: generated.length,
                host_code: compiled.code,
                relocations: compiled.relocations,
                thread_ref_count: thread.object_cache_ref_count.clone(),
            });
        }

        Ok(ptr)
    }

    /// Allocate `bytes` into `buffer`, clearing it wholesale and retrying
    /// once if it doesn't fit. Per §5, buffers are never resized, so a
    /// clear first drains `ref_count` -- the thread's outstanding
    /// object-cache serialization jobs -- so the worker thread never reads
    /// code the clear is about to overwrite.
    fn allocate_with_retry(
        buffer: &CodeBuffer,
        lookup_cache: &crate::cache::LookupCache,
        object_cache: &ObjectCacheService,
        ref_count: &std::sync::atomic::AtomicU64,
        bytes: &[u8],
    ) -> Option<HostCodePtr> {
        if let Some(ptr) = buffer.allocate(bytes) {
            return Some(ptr);
        }
        object_cache.wait_for_empty_job_queue(ref_count);
        buffer.clear();
        lookup_cache.clear();
        buffer.allocate(bytes)
    }
}
