//! C4 — CompilationPipeline: decode -> IR build -> passes, for one guest
//! entry point.
//!
//! Grounded on `Core.cpp`'s `Context::GenerateIR` for the decode/dispatch
//! loop and SMC-guard placement, and on
//! `raya-engine/src/jit/pipeline/mod.rs`'s `JitPipeline<B>` for the overall
//! decode-then-optimize shape and test style.

use crate::cache::CodePageIndex;
use crate::custom_ir::CustomIrHandlers;
use crate::error::PipelineError;
use dbt_sdk::{
    Config, DispatchBuilder, DispatchOutcome, FrontendDecoder, GuestRip, IrTextCodec, PassManager,
    SmcChecks, SyscallHandler,
};
use std::sync::Arc;

/// Output of a successful [`CompilationPipeline::generate_ir`] call.
pub struct GeneratedIr<Ir, Ra> {
    /// The finalized, pass-processed IR.
    pub ir: Ir,
    /// Register allocation metadata, if a RA pass ran.
    pub ra_data: Option<Ra>,
    /// Guest instructions successfully translated.
    pub total_instructions: u64,
    /// Sum of translated instructions' byte lengths.
    pub total_instruction_length: u64,
    /// Guest address the block starts at.
    pub start_addr: GuestRip,
    /// Total guest byte length covered by the block.
    pub length: u64,
}

/// Decode -> IR -> passes pipeline for one thread. Owns the reusable IR
/// builder; the decoder, pass manager, and page index are shared across
/// threads.
pub struct CompilationPipeline<D: DispatchBuilder> {
    builder: D,
    decoder: Arc<dyn FrontendDecoder>,
    pass_manager: Arc<dyn PassManager<Ir = D::Ir, RegisterAllocationData = D::RegisterAllocationData>>,
    syscall_handler: Arc<dyn SyscallHandler>,
    page_index: Arc<CodePageIndex>,
    custom_ir: Arc<CustomIrHandlers>,
    ir_codec: Option<Arc<dyn IrTextCodec<Ir = D::Ir>>>,
}

impl<D: DispatchBuilder> CompilationPipeline<D> {
    /// Construct a pipeline around a fresh, owned `builder`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        builder: D,
        decoder: Arc<dyn FrontendDecoder>,
        pass_manager: Arc<dyn PassManager<Ir = D::Ir, RegisterAllocationData = D::RegisterAllocationData>>,
        syscall_handler: Arc<dyn SyscallHandler>,
        page_index: Arc<CodePageIndex>,
        custom_ir: Arc<CustomIrHandlers>,
        ir_codec: Option<Arc<dyn IrTextCodec<Ir = D::Ir>>>,
    ) -> Self {
        CompilationPipeline {
            builder,
            decoder,
            pass_manager,
            syscall_handler,
            page_index,
            custom_ir,
            ir_codec,
        }
    }

    /// Decode and translate the block at `rip`, run passes, and return the
    /// result. Returns `Err(PipelineError::EmptyBlock)` if not a single
    /// instruction translated (matching the original's "GenerateIR returns
    /// empty" path); callers treat that as a full-compile failure.
    pub fn generate_ir(
        &mut self,
        rip: GuestRip,
        config: &Config,
    ) -> Result<GeneratedIr<D::Ir, D::RegisterAllocationData>, PipelineError> {
        self.builder.reset();

        if self.custom_ir.contains(rip) {
            self.custom_ir.invoke(rip);
            self.builder.finish_op(rip, true);
            let (mut ir, total_instructions, total_len) = self.builder.finalize();
            self.maybe_validate(&ir, config);
            let ra_data = self.pass_manager.run(&mut ir);
            return Ok(GeneratedIr {
                ir,
                ra_data,
                total_instructions,
                total_instruction_length: total_len,
                start_addr: rip,
                length: 1,
            });
        }

        let page_index = self.page_index.clone();
        let syscall_handler = self.syscall_handler.clone();
        let mut on_block = move |block: dbt_sdk::DecodedBlockRange| {
            let newly_touched = page_index.add_block_executable_range(block.entry, block.start, block.length);
            syscall_handler.mark_guest_executable_range(block.start, block.length, newly_touched);
        };

        let instructions = self
            .decoder
            .decode_instructions_at_entry(rip, config.multiblock, &mut on_block)
            .map_err(|_| PipelineError::EmptyBlock(rip))?;

        if instructions.is_empty() {
            return Err(PipelineError::EmptyBlock(rip));
        }

        let mut translated = 0u64;
        let mut translated_len = 0u64;
        let last_index = instructions.len() - 1;
        let mut early_exit_at: Option<GuestRip> = None;

        for (i, instr) in instructions.iter().enumerate() {
            let is_last = i == last_index;

            if config.smc_checks == SmcChecks::Full {
                self.builder.emit_smc_guard(instr);
            }

            let outcome = match instr.op_index {
                Some(_) => self.builder.dispatch(instr, is_last),
                None => {
                    self.builder.emit_invalid_op(instr);
                    DispatchOutcome::HandledTerminal
                }
            };

            match outcome {
                DispatchOutcome::Handled => {
                    translated += 1;
                    translated_len += instr.length as u64;
                }
                DispatchOutcome::HandledTerminal => {
                    translated += 1;
                    translated_len += instr.length as u64;
                    self.builder.finish_op(instr.address, true);
                    break;
                }
                DispatchOutcome::Unhandled | DispatchOutcome::DispatchError => {
                    if instr.has_lock_prefix {
                        log::warn!("dispatch mismatch (LOCK prefix) at {:?}", instr.address);
                    }
                    if translated == 0 {
                        return Err(PipelineError::EmptyBlock(rip));
                    }
                    early_exit_at = Some(GuestRip(instr.address.0));
                    break;
                }
            }

            if !is_last && translated >= config.max_inst_per_block {
                self.builder.finish_op(instr.address, true);
                early_exit_at = Some(GuestRip(instr.address.0 + instr.length as u64));
                break;
            }

            self.builder.finish_op(instr.address, is_last);
        }

        if let Some(exit_at) = early_exit_at {
            self.builder.emit_exit_function(exit_at);
        }

        let (ir, _ignored_total, _ignored_len) = self.builder.finalize();
        self.maybe_validate(&ir, config);

        let mut ir = ir;
        let ra_data = self.pass_manager.run(&mut ir);

        Ok(GeneratedIr {
            ir,
            ra_data,
            total_instructions: translated,
            total_instruction_length: translated_len,
            start_addr: rip,
            length: translated_len,
        })
    }

    fn maybe_validate(&self, ir: &D::Ir, config: &Config) {
        if !config.validate_ir_parser {
            return;
        }
        if let Some(codec) = &self.ir_codec {
            let text1 = codec.to_text(ir);
            let reparsed = codec.from_text(&text1);
            let text2 = codec.to_text(&reparsed);
            if text1 != text2 {
                log::warn!("IR text round-trip mismatch for block");
            }
        }
    }

    /// The decoder this pipeline drives, for peeking at collaborator state
    /// in tests.
    pub fn decoder(&self) -> &Arc<dyn FrontendDecoder> {
        &self.decoder
    }
}
