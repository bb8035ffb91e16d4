//! Register method dispatch.
//!
//! Every register write flows through [`MethodTable::dispatch`]: the
//! value is latched first, then the register's handler reacts. Handlers
//! that reject a value roll the latch back to its previous state, so the
//! register file never holds an encoding the rest of the pipeline cannot
//! interpret.
//!
//! Register identifiers are the method byte offsets from the command
//! stream (0x0000..0x2000, word aligned).

use cgx_core::error::GpuError;
use cgx_memory::WordSpan;

use crate::barrier::BarrierKind;
use crate::clause::{DrawCommand, Primitive};
use crate::regs::{self, PipelineDirty};
use crate::sync;
use crate::thread::Context;

// NV406E: FIFO engine methods
pub const NV406E_SET_REFERENCE: u32 = 0x0050;
pub const NV406E_SET_CONTEXT_DMA_SEMAPHORE: u32 = 0x0060;
pub const NV406E_SEMAPHORE_OFFSET: u32 = 0x0064;
pub const NV406E_SEMAPHORE_ACQUIRE: u32 = 0x0068;
pub const NV406E_SEMAPHORE_RELEASE: u32 = 0x006C;

// NV4097: 3D engine methods
pub const NV4097_NO_OPERATION: u32 = 0x0100;
pub const NV4097_SET_SURFACE_FORMAT: u32 = 0x0180;
pub const NV4097_SET_CONTEXT_DMA_REPORT: u32 = 0x01C0;
pub const NV4097_SET_SURFACE_COLOR_TARGET: u32 = 0x0200;
pub const NV4097_SET_COLOR_CLEAR_VALUE: u32 = 0x0304;
pub const NV4097_SET_ZSTENCIL_CLEAR_VALUE: u32 = 0x0308;
pub const NV4097_SET_DEPTH_TEST_ENABLE: u32 = 0x030C;
pub const NV4097_SET_BLEND_ENABLE: u32 = 0x0310;
pub const NV4097_SET_BLEND_FUNC_SFACTOR: u32 = 0x0314;
pub const NV4097_SET_BLEND_FUNC_DFACTOR: u32 = 0x0318;
pub const NV4097_SET_COLOR_MASK: u32 = 0x0324;
pub const NV4097_SET_BLEND_EQUATION: u32 = 0x0340;
pub const NV4097_SET_STENCIL_TEST_ENABLE: u32 = 0x0348;
pub const NV4097_SET_STENCIL_FUNC: u32 = 0x034C;
pub const NV4097_SET_STENCIL_OP_FAIL: u32 = 0x0358;
pub const NV4097_SET_STENCIL_OP_ZFAIL: u32 = 0x035C;
pub const NV4097_SET_STENCIL_OP_ZPASS: u32 = 0x0360;
pub const NV4097_SET_SHADE_MODE: u32 = 0x0370;
pub const NV4097_SET_DEPTH_FUNC: u32 = 0x0374;
pub const NV4097_SET_DEPTH_MASK: u32 = 0x0378;
pub const NV4097_SET_ALPHA_TEST_ENABLE: u32 = 0x037C;
pub const NV4097_SET_ALPHA_FUNC: u32 = 0x0380;
pub const NV4097_SET_ALPHA_REF: u32 = 0x0384;
pub const NV4097_SET_CULL_FACE_ENABLE: u32 = 0x0410;
pub const NV4097_SET_CULL_FACE: u32 = 0x0414;
pub const NV4097_SET_FRONT_FACE: u32 = 0x0418;
pub const NV4097_SET_LOGIC_OP_ENABLE: u32 = 0x0420;
pub const NV4097_SET_LOGIC_OP: u32 = 0x0424;
pub const NV4097_SET_SHADER_PROGRAM: u32 = 0x0848;
pub const NV4097_SET_VERTEX_TEXTURE_OFFSET: u32 = 0x0900;
pub const NV4097_SET_TRANSFORM_PROGRAM: u32 = 0x0B80;
pub const NV4097_SET_VERTEX_ATTRIB_INPUT_MASK: u32 = 0x1640;
pub const NV4097_SET_VERTEX_ATTRIB_OUTPUT_MASK: u32 = 0x1644;
pub const NV4097_SET_VERTEX_DATA_ARRAY_OFFSET: u32 = 0x1680;
pub const NV4097_SET_VERTEX_DATA_BASE_OFFSET: u32 = 0x1738;
pub const NV4097_SET_VERTEX_DATA_BASE_INDEX: u32 = 0x173C;
pub const NV4097_SET_VERTEX_DATA_ARRAY_FORMAT: u32 = 0x1740;
pub const NV4097_SET_BEGIN_END: u32 = 0x1808;
pub const NV4097_DRAW_ARRAYS: u32 = 0x1810;
pub const NV4097_DRAW_INDEX_ARRAY: u32 = 0x1814;
pub const NV4097_INLINE_ARRAY: u32 = 0x1818;
pub const NV4097_SET_INDEX_ARRAY_ADDRESS: u32 = 0x181C;
pub const NV4097_SET_INDEX_ARRAY_DMA: u32 = 0x1820;
pub const NV4097_ARRAY_ELEMENT16: u32 = 0x1824;
pub const NV4097_ARRAY_ELEMENT32: u32 = 0x1828;
pub const NV4097_SET_TEXTURE_OFFSET: u32 = 0x1A00;
pub const NV4097_SET_TEXTURE_FORMAT: u32 = 0x1A04;
pub const NV4097_SET_TEXTURE_CONTROL0: u32 = 0x1A08;
pub const NV4097_SET_TEXTURE_FILTER: u32 = 0x1A0C;
pub const NV4097_SET_VERTEX_DATA4F_M: u32 = 0x1C00;
pub const NV4097_SET_SEMAPHORE_OFFSET: u32 = 0x1D6C;
pub const NV4097_BACK_END_WRITE_SEMAPHORE_RELEASE: u32 = 0x1D70;
pub const NV4097_TEXTURE_READ_SEMAPHORE_RELEASE: u32 = 0x1D7C;
pub const NV4097_GET_REPORT: u32 = 0x1D88;
pub const NV4097_CLEAR_SURFACE: u32 = 0x1D94;
pub const NV4097_SET_TRANSFORM_PROGRAM_LOAD: u32 = 0x1E9C;
pub const NV4097_SET_TRANSFORM_PROGRAM_START: u32 = 0x1EA0;
pub const NV4097_SET_TRANSFORM_CONSTANT_LOAD: u32 = 0x1EFC;
pub const NV4097_SET_TRANSFORM_CONSTANT: u32 = 0x1F00;
pub const NV4097_SET_FREQUENCY_DIVIDER_OPERATION: u32 = 0x1FC0;

/// Spacing between texture units in the register map
pub const TEXTURE_UNIT_STRIDE: u32 = 0x20;

/// Color/depth/stencil lanes of the clear-surface argument
pub const CLEAR_SURFACE_VALID_MASK: u32 = 0xF3;

pub type MethodHandler = fn(&mut Context<'_>, u32, u32);

/// Applies a run of incrementing argument words in one call, returning
/// how many words were consumed. The span never extends past the
/// producer pointer or the register window.
pub type BatchHandler = fn(&mut Context<'_>, u32, &WordSpan<'_>) -> u32;

#[derive(Clone, Copy)]
struct MethodEntry {
    handler: MethodHandler,
    batch: Option<BatchHandler>,
    /// Batch even when the header is non-incrementing (every word goes
    /// to this same register)
    batch_same_register: bool,
    /// Drop the write entirely when the value equals the current latch
    compare_latch: bool,
    barrier: Option<BarrierKind>,
    window_base: u32,
    window_len: u32,
}

impl MethodEntry {
    fn new(handler: MethodHandler) -> Self {
        Self {
            handler,
            batch: None,
            batch_same_register: false,
            compare_latch: false,
            barrier: None,
            window_base: 0,
            window_len: 1,
        }
    }

    fn latched(mut self) -> Self {
        self.compare_latch = true;
        self
    }

    fn barrier(mut self, kind: BarrierKind) -> Self {
        self.barrier = Some(kind);
        self
    }

    fn batched(mut self, f: BatchHandler, window_base: u32, window_len: u32) -> Self {
        self.batch = Some(f);
        self.window_base = window_base;
        self.window_len = window_len;
        self
    }

    fn batch_same_register(mut self) -> Self {
        self.batch_same_register = true;
        self
    }
}

/// Dispatch table indexed by register word offset. Built once; shared
/// by the processing loop and barrier replay.
pub struct MethodTable {
    entries: Vec<Option<MethodEntry>>,
}

impl MethodTable {
    pub fn new() -> Self {
        let mut t = Self {
            entries: vec![None; regs::REGISTER_COUNT],
        };

        t.set(NV406E_SET_REFERENCE, MethodEntry::new(sync::set_reference));
        t.set(NV406E_SET_CONTEXT_DMA_SEMAPHORE, MethodEntry::new(store_only));
        t.set(NV406E_SEMAPHORE_OFFSET, MethodEntry::new(store_only));
        t.set(
            NV406E_SEMAPHORE_ACQUIRE,
            MethodEntry::new(sync::semaphore_acquire),
        );
        t.set(
            NV406E_SEMAPHORE_RELEASE,
            MethodEntry::new(sync::semaphore_release),
        );

        t.set(NV4097_NO_OPERATION, MethodEntry::new(store_only));
        t.set(NV4097_SET_SURFACE_FORMAT, MethodEntry::new(surface_format));
        t.set(NV4097_SET_CONTEXT_DMA_REPORT, MethodEntry::new(store_only));
        t.set(
            NV4097_SET_SURFACE_COLOR_TARGET,
            MethodEntry::new(latched_config).latched(),
        );
        t.set(NV4097_SET_COLOR_CLEAR_VALUE, MethodEntry::new(store_only));
        t.set(NV4097_SET_ZSTENCIL_CLEAR_VALUE, MethodEntry::new(store_only));

        const PIPELINE_REGS: &[u32] = &[
            NV4097_SET_DEPTH_TEST_ENABLE,
            NV4097_SET_BLEND_ENABLE,
            NV4097_SET_BLEND_FUNC_SFACTOR,
            NV4097_SET_BLEND_FUNC_DFACTOR,
            NV4097_SET_COLOR_MASK,
            NV4097_SET_BLEND_EQUATION,
            NV4097_SET_STENCIL_TEST_ENABLE,
            NV4097_SET_STENCIL_FUNC,
            NV4097_SET_STENCIL_OP_FAIL,
            NV4097_SET_STENCIL_OP_ZFAIL,
            NV4097_SET_STENCIL_OP_ZPASS,
            NV4097_SET_SHADE_MODE,
            NV4097_SET_DEPTH_FUNC,
            NV4097_SET_DEPTH_MASK,
            NV4097_SET_ALPHA_TEST_ENABLE,
            NV4097_SET_ALPHA_FUNC,
            NV4097_SET_ALPHA_REF,
            NV4097_SET_CULL_FACE_ENABLE,
            NV4097_SET_CULL_FACE,
            NV4097_SET_FRONT_FACE,
            NV4097_SET_LOGIC_OP_ENABLE,
            NV4097_SET_LOGIC_OP,
        ];
        for &reg in PIPELINE_REGS {
            t.set(reg, MethodEntry::new(latched_config).latched());
        }

        t.set(
            NV4097_SET_SHADER_PROGRAM,
            MethodEntry::new(latched_config).latched(),
        );
        for unit in 0..regs::VERTEX_TEXTURE_UNITS as u32 {
            t.set(
                NV4097_SET_VERTEX_TEXTURE_OFFSET + unit * TEXTURE_UNIT_STRIDE,
                MethodEntry::new(vertex_texture).latched(),
            );
        }
        for unit in 0..regs::FRAGMENT_TEXTURE_UNITS as u32 {
            let base = NV4097_SET_TEXTURE_OFFSET + unit * TEXTURE_UNIT_STRIDE;
            for field in [0x0, 0x4, 0x8, 0xC] {
                t.set(base + field, MethodEntry::new(fragment_texture).latched());
            }
        }

        for i in 0..32 {
            t.set(
                NV4097_SET_TRANSFORM_PROGRAM + i * 4,
                MethodEntry::new(transform_program).batched(
                    transform_program_batch,
                    NV4097_SET_TRANSFORM_PROGRAM,
                    32,
                ),
            );
        }

        t.set(
            NV4097_SET_VERTEX_ATTRIB_INPUT_MASK,
            MethodEntry::new(latched_config).latched(),
        );
        t.set(
            NV4097_SET_VERTEX_ATTRIB_OUTPUT_MASK,
            MethodEntry::new(latched_config).latched(),
        );

        for attr in 0..regs::VERTEX_ATTRIBUTES as u32 {
            t.set(
                NV4097_SET_VERTEX_DATA_ARRAY_OFFSET + attr * 4,
                MethodEntry::new(latched_config)
                    .latched()
                    .barrier(BarrierKind::VertexArrayOffset),
            );
            t.set(
                NV4097_SET_VERTEX_DATA_ARRAY_FORMAT + attr * 4,
                MethodEntry::new(latched_config).latched(),
            );
        }
        t.set(
            NV4097_SET_VERTEX_DATA_BASE_OFFSET,
            MethodEntry::new(latched_config)
                .latched()
                .barrier(BarrierKind::VertexBaseOffset),
        );
        t.set(
            NV4097_SET_VERTEX_DATA_BASE_INDEX,
            MethodEntry::new(latched_config)
                .latched()
                .barrier(BarrierKind::IndexBaseOffset),
        );

        t.set(NV4097_SET_BEGIN_END, MethodEntry::new(begin_end));
        t.set(NV4097_DRAW_ARRAYS, MethodEntry::new(draw_arrays));
        t.set(NV4097_DRAW_INDEX_ARRAY, MethodEntry::new(draw_index_array));
        t.set(
            NV4097_INLINE_ARRAY,
            MethodEntry::new(inline_array)
                .batched(inline_array_batch, NV4097_INLINE_ARRAY, 1)
                .batch_same_register(),
        );
        t.set(NV4097_SET_INDEX_ARRAY_ADDRESS, MethodEntry::new(store_only));
        t.set(NV4097_SET_INDEX_ARRAY_DMA, MethodEntry::new(index_array_dma));
        t.set(NV4097_ARRAY_ELEMENT16, MethodEntry::new(array_element16));
        t.set(NV4097_ARRAY_ELEMENT32, MethodEntry::new(array_element32));

        for word in 0..(regs::VERTEX_ATTRIBUTES as u32 * 4) {
            t.set(
                NV4097_SET_VERTEX_DATA4F_M + word * 4,
                MethodEntry::new(vertex_data4f),
            );
        }

        t.set(NV4097_SET_SEMAPHORE_OFFSET, MethodEntry::new(store_only));
        t.set(
            NV4097_BACK_END_WRITE_SEMAPHORE_RELEASE,
            MethodEntry::new(sync::back_end_write_semaphore_release),
        );
        t.set(
            NV4097_TEXTURE_READ_SEMAPHORE_RELEASE,
            MethodEntry::new(sync::texture_read_semaphore_release),
        );
        t.set(NV4097_GET_REPORT, MethodEntry::new(sync::get_report));
        t.set(NV4097_CLEAR_SURFACE, MethodEntry::new(clear_surface));

        t.set(
            NV4097_SET_TRANSFORM_PROGRAM_LOAD,
            MethodEntry::new(transform_program_load),
        );
        t.set(
            NV4097_SET_TRANSFORM_PROGRAM_START,
            MethodEntry::new(latched_config).latched(),
        );
        t.set(
            NV4097_SET_TRANSFORM_CONSTANT_LOAD,
            MethodEntry::new(transform_constant_load)
                .latched()
                .barrier(BarrierKind::TransformConstantLoad),
        );
        for i in 0..32 {
            t.set(
                NV4097_SET_TRANSFORM_CONSTANT + i * 4,
                MethodEntry::new(transform_constant).batched(
                    transform_constant_batch,
                    NV4097_SET_TRANSFORM_CONSTANT,
                    32,
                ),
            );
        }
        t.set(
            NV4097_SET_FREQUENCY_DIVIDER_OPERATION,
            MethodEntry::new(store_only),
        );

        t
    }

    fn set(&mut self, reg: u32, entry: MethodEntry) {
        self.entries[(reg >> 2) as usize] = Some(entry);
    }

    fn entry(&self, reg: u32) -> Option<&MethodEntry> {
        self.entries.get((reg >> 2) as usize)?.as_ref()
    }

    /// Whether `reg` is registered at all
    pub fn is_known(&self, reg: u32) -> bool {
        self.entry(reg).is_some()
    }

    /// Batch handler for `reg` and the number of words remaining in its
    /// register window, if `reg` supports batching under the given
    /// header mode.
    pub fn batch_handler(&self, reg: u32, non_increment: bool) -> Option<(BatchHandler, u32)> {
        let entry = self.entry(reg)?;
        let f = entry.batch?;
        if non_increment {
            if !entry.batch_same_register {
                return None;
            }
            // Same register every word: the window never runs out
            return Some((f, u32::MAX));
        }
        let window_end = entry.window_base + entry.window_len * 4;
        Some((f, (window_end - reg) >> 2))
    }

    /// Latch a value and run the register's handler.
    ///
    /// Unknown registers still latch (the value is observable through a
    /// later read-back) but have no side effects. Writes that restate
    /// the current latch are dropped for compare-latch registers.
    /// Barrier-eligible registers defer their effect while a draw is
    /// accumulating.
    pub fn dispatch(&self, ctx: &mut Context<'_>, reg: u32, value: u32) {
        ctx.counters.methods_processed += 1;
        if (reg >> 2) as usize >= regs::REGISTER_COUNT {
            tracing::warn!("register 0x{reg:04x} outside the method range");
            return;
        }
        let old = ctx.regs.commit(reg, value);
        let Some(entry) = self.entry(reg) else {
            tracing::trace!("unhandled register 0x{reg:04x} = 0x{value:08x}");
            return;
        };
        if entry.compare_latch && old == value {
            return;
        }
        if let Some(kind) = entry.barrier {
            if ctx.clause.in_begin_end && !ctx.replaying_barriers {
                ctx.regs.commit(reg, old);
                ctx.barriers
                    .enqueue(kind, reg, value, barrier_index(kind, reg), barrier_address(kind, value));
                return;
            }
        }
        ctx.prior = old;
        (entry.handler)(ctx, reg, value);
    }
}

impl Default for MethodTable {
    fn default() -> Self {
        Self::new()
    }
}

fn barrier_index(kind: BarrierKind, reg: u32) -> u32 {
    match kind {
        BarrierKind::VertexArrayOffset => (reg - NV4097_SET_VERTEX_DATA_ARRAY_OFFSET) / 4,
        _ => 0,
    }
}

fn barrier_address(kind: BarrierKind, value: u32) -> Option<u32> {
    match kind {
        // Keyed by destination slot address so overlapping loads apply
        // in bank order
        BarrierKind::TransformConstantLoad => Some(value * 16),
        _ => None,
    }
}

/// Apply every barrier queued during the draw that just closed, in
/// their defined order. The writes re-enter dispatch with the replay
/// flag set so they cannot re-defer.
pub fn replay_barriers(ctx: &mut Context<'_>) {
    if ctx.barriers.is_empty() {
        return;
    }
    let table = ctx.table;
    let batch = ctx.barriers.drain_ordered();
    ctx.replaying_barriers = true;
    for b in &batch {
        table.dispatch(ctx, b.register, b.arg);
    }
    ctx.replaying_barriers = false;
}

// ---- handlers ----

/// The latch itself is the whole effect
fn store_only(_ctx: &mut Context<'_>, _reg: u32, _value: u32) {}

/// Validated configuration register: reject-and-rollback on a bad
/// encoding, otherwise mark the covering dirty bits.
fn latched_config(ctx: &mut Context<'_>, reg: u32, value: u32) {
    if !encoding_is_valid(reg, value) {
        tracing::warn!(
            "{}; keeping 0x{:08x}",
            GpuError::InvalidEncoding { reg, value },
            ctx.prior
        );
        ctx.regs.commit(reg, ctx.prior);
        return;
    }
    ctx.regs.dirty |= dirty_bits(reg);
}

/// Surface format carries log2 dimension hints in its upper half that
/// do not affect pipeline state; only a change in the low 16 bits is a
/// real reconfiguration.
fn surface_format(ctx: &mut Context<'_>, _reg: u32, value: u32) {
    if (ctx.prior ^ value) & 0xFFFF != 0 {
        ctx.regs.dirty |= PipelineDirty::SURFACE_CONFIG;
    }
}

fn fragment_texture(ctx: &mut Context<'_>, reg: u32, _value: u32) {
    let unit = (reg - NV4097_SET_TEXTURE_OFFSET) / TEXTURE_UNIT_STRIDE;
    ctx.regs.fragment_textures_dirty[unit as usize] = true;
    ctx.backend.on_texture_dirty(unit);
}

fn vertex_texture(ctx: &mut Context<'_>, reg: u32, _value: u32) {
    let unit = (reg - NV4097_SET_VERTEX_TEXTURE_OFFSET) / TEXTURE_UNIT_STRIDE;
    ctx.regs.vertex_textures_dirty[unit as usize] = true;
    ctx.backend.on_vertex_texture_dirty(unit);
}

fn begin_end(ctx: &mut Context<'_>, _reg: u32, value: u32) {
    if value != 0 {
        match Primitive::from_code(value) {
            Some(primitive) => {
                ctx.clause.begin(primitive);
                ctx.backend.begin();
            }
            None => {
                tracing::warn!("begin with unrecognized primitive code {value}");
                ctx.clause.begin_unrecognized();
            }
        }
    } else {
        end_of_draw(ctx);
    }
}

fn end_of_draw(ctx: &mut Context<'_>) {
    if !ctx.clause.in_begin_end {
        tracing::warn!("end without a matching begin");
    }
    ctx.clause.in_begin_end = false;

    if ctx.clause.is_empty() {
        tracing::trace!("draw clause closed with no content");
        replay_barriers(ctx);
    } else {
        // The compiled clause snapshots the geometry before deferred
        // writes land, so the closing draw cannot observe them; the end
        // hook then sees the post-barrier register state.
        ctx.clause.compile();
        replay_barriers(ctx);
        let instanced = ctx.regs.get(NV4097_SET_FREQUENCY_DIVIDER_OPERATION) != 0;
        if instanced != ctx.regs.vertex_program_instanced {
            ctx.regs.vertex_program_instanced = instanced;
            ctx.backend.set_instanced(instanced);
        }
        ctx.backend.end(ctx.clause, ctx.regs);
        ctx.counters.draw_calls += 1;
    }
    ctx.clause.reset();

    if ctx.exec.step_pending {
        ctx.exec.step_pending = false;
        ctx.exec.paused = true;
        tracing::debug!("paused after draw clause");
    }
}

fn draw_arrays(ctx: &mut Context<'_>, _reg: u32, value: u32) {
    if !ctx.clause.in_begin_end {
        tracing::warn!("draw-arrays range outside begin/end, ignored");
        return;
    }
    let first = value & 0x00FF_FFFF;
    let count = (value >> 24) + 1;
    ctx.clause.append_range(DrawCommand::Array, first, count);
}

fn draw_index_array(ctx: &mut Context<'_>, _reg: u32, value: u32) {
    if !ctx.clause.in_begin_end {
        tracing::warn!("draw-index range outside begin/end, ignored");
        return;
    }
    let first = value & 0x00FF_FFFF;
    let count = (value >> 24) + 1;
    ctx.clause.append_range(DrawCommand::Indexed, first, count);
}

fn inline_array(ctx: &mut Context<'_>, _reg: u32, value: u32) {
    ctx.clause.append_inline_words([value]);
}

fn inline_array_batch(ctx: &mut Context<'_>, first_reg: u32, words: &WordSpan<'_>) -> u32 {
    if !words.is_empty() {
        // Every word targets the same register; its latch ends up
        // holding the last one, as single dispatch would leave it
        ctx.regs.commit(first_reg, words.get(words.len() - 1));
    }
    ctx.clause
        .append_inline_words((0..words.len()).map(|i| words.get(i)));
    words.len()
}

/// Validates the index source before it can poison a later draw; a bad
/// DMA selector means the stream itself is corrupt.
fn index_array_dma(ctx: &mut Context<'_>, reg: u32, value: u32) {
    let location = value & 0xF;
    let index_type = (value >> 4) & 0xF;
    if index_type > 1 || ctx.map.resolve(location, 0).is_err() {
        tracing::error!("{}", GpuError::InvalidEncoding { reg, value });
        ctx.regs.commit(reg, ctx.prior);
        ctx.cursor.request_recovery();
        return;
    }
    ctx.regs.dirty |= PipelineDirty::VERTEX_STATE;
}

fn array_element16(ctx: &mut Context<'_>, _reg: u32, value: u32) {
    ctx.clause.push_index(value & 0xFFFF);
    ctx.clause.push_index(value >> 16);
}

fn array_element32(ctx: &mut Context<'_>, _reg: u32, value: u32) {
    ctx.clause.push_index(value);
}

fn vertex_data4f(ctx: &mut Context<'_>, reg: u32, value: u32) {
    let word = (reg - NV4097_SET_VERTEX_DATA4F_M) >> 2;
    ctx.clause.push_immediate_word(word >> 2, word & 3, value);
}

fn clear_surface(ctx: &mut Context<'_>, _reg: u32, value: u32) {
    if value & CLEAR_SURFACE_VALID_MASK == 0 {
        tracing::trace!("clear-surface with empty mask, skipped");
        return;
    }
    ctx.backend.clear_surface(value);
}

fn transform_program_load(ctx: &mut Context<'_>, reg: u32, value: u32) {
    if value as usize >= regs::TRANSFORM_PROGRAM_SLOTS {
        tracing::warn!("{}", GpuError::InvalidEncoding { reg, value });
        ctx.regs.commit(reg, ctx.prior);
        return;
    }
    ctx.regs.transform_program_pointer = value * 4;
}

fn store_program_word(ctx: &mut Context<'_>, value: u32) -> bool {
    let ptr = ctx.regs.transform_program_pointer as usize;
    match ctx.regs.transform_program.get_mut(ptr) {
        Some(slot) => {
            *slot = value;
            ctx.regs.transform_program_pointer += 1;
            ctx.regs.dirty |= PipelineDirty::VERTEX_PROGRAM;
            true
        }
        None => false,
    }
}

fn transform_program(ctx: &mut Context<'_>, _reg: u32, value: u32) {
    if !store_program_word(ctx, value) {
        tracing::warn!(
            "{}",
            GpuError::OutOfRangeWrite {
                offset: ctx.regs.transform_program_pointer,
                count: 1,
                capacity: (regs::TRANSFORM_PROGRAM_SLOTS * 4) as u32,
            }
        );
    }
}

fn transform_program_batch(ctx: &mut Context<'_>, first_reg: u32, words: &WordSpan<'_>) -> u32 {
    let mut dropped = 0;
    for i in 0..words.len() {
        let value = words.get(i);
        // Each word latches its register exactly as it would one at a
        // time through dispatch
        ctx.regs.commit(first_reg + i * 4, value);
        if !store_program_word(ctx, value) {
            dropped += 1;
        }
    }
    if dropped > 0 {
        tracing::warn!(
            "{}",
            GpuError::OutOfRangeWrite {
                offset: ctx.regs.transform_program_pointer,
                count: dropped,
                capacity: (regs::TRANSFORM_PROGRAM_SLOTS * 4) as u32,
            }
        );
    }
    // Overflow words are dropped but still consumed from the stream
    words.len()
}

fn transform_constant_load(ctx: &mut Context<'_>, reg: u32, value: u32) {
    if value as usize >= regs::TRANSFORM_CONSTANT_SLOTS {
        tracing::warn!("{}", GpuError::InvalidEncoding { reg, value });
        ctx.regs.commit(reg, ctx.prior);
    }
}

/// Store one constant word. `None` means past the end of the bank,
/// `Some(changed)` otherwise.
fn store_constant_word(ctx: &mut Context<'_>, word: u32, value: u32) -> Option<bool> {
    let slot = ctx.regs.transform_constants.get_mut(word as usize)?;
    if *slot == value {
        return Some(false);
    }
    *slot = value;
    Some(true)
}

fn constant_dest_word(ctx: &Context<'_>, reg: u32) -> u32 {
    let load = ctx.regs.get(NV4097_SET_TRANSFORM_CONSTANT_LOAD);
    load * 4 + ((reg - NV4097_SET_TRANSFORM_CONSTANT) >> 2)
}

fn transform_constant(ctx: &mut Context<'_>, reg: u32, value: u32) {
    let word = constant_dest_word(ctx, reg);
    match store_constant_word(ctx, word, value) {
        Some(true) => {
            ctx.regs.dirty |= PipelineDirty::TRANSFORM_CONSTANTS;
            if ctx.clause.in_begin_end {
                ctx.backend.patch_transform_constants(word / 4, 1);
            }
        }
        Some(false) => {}
        None => tracing::warn!(
            "{}",
            GpuError::OutOfRangeWrite {
                offset: word,
                count: 1,
                capacity: (regs::TRANSFORM_CONSTANT_SLOTS * 4) as u32,
            }
        ),
    }
}

fn patch_constant_run(ctx: &mut Context<'_>, first_slot: u32, last_slot: u32) {
    if ctx.clause.in_begin_end {
        ctx.backend
            .patch_transform_constants(first_slot, last_slot - first_slot + 1);
    }
}

fn transform_constant_batch(ctx: &mut Context<'_>, first_reg: u32, words: &WordSpan<'_>) -> u32 {
    let base = constant_dest_word(ctx, first_reg);
    // Contiguous run of changed slots; a gap flushes its own patch so
    // untouched slots are never re-uploaded
    let mut run: Option<(u32, u32)> = None;
    let mut dropped = 0;
    for i in 0..words.len() {
        let value = words.get(i);
        // Each word latches its register exactly as it would one at a
        // time through dispatch
        ctx.regs.commit(first_reg + i * 4, value);
        match store_constant_word(ctx, base + i, value) {
            Some(true) => {
                ctx.regs.dirty |= PipelineDirty::TRANSFORM_CONSTANTS;
                let slot = (base + i) / 4;
                run = match run {
                    Some((first, last)) if slot <= last + 1 => Some((first, slot)),
                    Some((first, last)) => {
                        patch_constant_run(ctx, first, last);
                        Some((slot, slot))
                    }
                    None => Some((slot, slot)),
                };
            }
            Some(false) => {}
            None => dropped += 1,
        }
    }
    if let Some((first, last)) = run {
        patch_constant_run(ctx, first, last);
    }
    if dropped > 0 {
        tracing::warn!(
            "{}",
            GpuError::OutOfRangeWrite {
                offset: base + words.len() - dropped,
                count: dropped,
                capacity: (regs::TRANSFORM_CONSTANT_SLOTS * 4) as u32,
            }
        );
    }
    words.len()
}

// ---- encoding validation ----

fn blend_factor_valid(factor: u32) -> bool {
    matches!(factor, 0 | 1 | 0x0300..=0x0308 | 0x8001..=0x8004)
}

fn stencil_op_valid(op: u32) -> bool {
    matches!(op, 0 | 0x150A | 0x1E00..=0x1E03 | 0x8507 | 0x8508)
}

fn compare_func_valid(func: u32) -> bool {
    (0x200..=0x207).contains(&func)
}

/// Whether `value` is a legal encoding for `reg`. Registers without an
/// enumerated encoding accept anything.
fn encoding_is_valid(reg: u32, value: u32) -> bool {
    match reg {
        NV4097_SET_SURFACE_COLOR_TARGET => matches!(value, 0 | 1 | 2 | 0x13 | 0x17 | 0x1F),
        NV4097_SET_BLEND_FUNC_SFACTOR | NV4097_SET_BLEND_FUNC_DFACTOR => {
            blend_factor_valid(value & 0xFFFF) && blend_factor_valid(value >> 16)
        }
        NV4097_SET_COLOR_MASK => value & !0x0101_0101 == 0,
        NV4097_SET_BLEND_EQUATION => {
            let eq_valid = |eq: u32| matches!(eq, 0x8006 | 0x8007 | 0x8008 | 0x800A | 0x800B);
            eq_valid(value & 0xFFFF) && eq_valid(value >> 16)
        }
        NV4097_SET_STENCIL_FUNC | NV4097_SET_DEPTH_FUNC | NV4097_SET_ALPHA_FUNC => {
            compare_func_valid(value)
        }
        NV4097_SET_LOGIC_OP => (0x1500..=0x150F).contains(&value),
        NV4097_SET_STENCIL_OP_FAIL | NV4097_SET_STENCIL_OP_ZFAIL | NV4097_SET_STENCIL_OP_ZPASS => {
            stencil_op_valid(value)
        }
        NV4097_SET_SHADE_MODE => matches!(value, 0x1D00 | 0x1D01),
        NV4097_SET_CULL_FACE => matches!(value, 0x404 | 0x405 | 0x408),
        NV4097_SET_FRONT_FACE => matches!(value, 0x900 | 0x901),
        NV4097_SET_TRANSFORM_PROGRAM_START => (value as usize) < regs::TRANSFORM_PROGRAM_SLOTS,
        _ => true,
    }
}

fn dirty_bits(reg: u32) -> PipelineDirty {
    match reg {
        NV4097_SET_SURFACE_COLOR_TARGET => PipelineDirty::SURFACE_CONFIG,
        NV4097_SET_SHADER_PROGRAM => PipelineDirty::FRAGMENT_PROGRAM,
        NV4097_SET_VERTEX_ATTRIB_INPUT_MASK
        | NV4097_SET_VERTEX_ATTRIB_OUTPUT_MASK
        | NV4097_SET_TRANSFORM_PROGRAM_START => PipelineDirty::VERTEX_PROGRAM,
        NV4097_SET_VERTEX_DATA_BASE_OFFSET | NV4097_SET_VERTEX_DATA_BASE_INDEX => {
            PipelineDirty::VERTEX_STATE
        }
        r if (NV4097_SET_VERTEX_DATA_ARRAY_OFFSET..NV4097_SET_VERTEX_DATA_ARRAY_OFFSET + 0x40)
            .contains(&r) =>
        {
            PipelineDirty::VERTEX_STATE
        }
        r if (NV4097_SET_VERTEX_DATA_ARRAY_FORMAT..NV4097_SET_VERTEX_DATA_ARRAY_FORMAT + 0x40)
            .contains(&r) =>
        {
            PipelineDirty::VERTEX_STATE
        }
        _ => PipelineDirty::PIPELINE_CONFIG,
    }
}
