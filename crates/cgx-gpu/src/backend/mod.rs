//! Renderer boundary.
//!
//! The command processor owns all register-level semantics; everything
//! downstream of "state is now correct, draw this" goes through
//! [`RenderBackend`]. Implementations read the register file they are
//! handed at draw end and react to dirty bits.

pub mod null;

use crate::clause::DrawClause;
use crate::regs::RegisterFile;

pub use null::NullBackend;

/// Notifications from the command processor to the renderer. Calls
/// arrive on the processing thread, in stream order.
pub trait RenderBackend: Send {
    /// A draw clause opened (recognized primitive)
    fn begin(&mut self);

    /// A non-empty draw clause closed; `draw` is compiled and `regs`
    /// already holds every register effect deferred past this draw
    fn end(&mut self, draw: &DrawClause, regs: &RegisterFile);

    /// Clear the bound surface; `mask` carries the raw clear bits
    /// (color/depth/stencil lanes)
    fn clear_surface(&mut self, mask: u32);

    /// Transform constants changed while a draw was accumulating; the
    /// renderer must patch slots `[load_slot, load_slot + count)` into
    /// any vertex program state it already captured
    fn patch_transform_constants(&mut self, load_slot: u32, count: u32);

    /// A fragment texture unit's configuration changed
    fn on_texture_dirty(&mut self, unit: u32);

    /// A vertex texture unit's configuration changed
    fn on_vertex_texture_dirty(&mut self, unit: u32);

    /// The bound vertex program's instancing characteristic changed
    fn set_instanced(&mut self, instanced: bool);

    /// Make all previously submitted work visible to other observers;
    /// called before any fence or semaphore value is published
    fn flush(&mut self);
}
