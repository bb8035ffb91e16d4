//! Backend that renders nothing. Used headless and in tests; also the
//! reference for how cheap a backend is allowed to be.

use super::RenderBackend;
use crate::clause::DrawClause;
use crate::regs::RegisterFile;

#[derive(Debug, Default)]
pub struct NullBackend {
    draws: u64,
    clears: u64,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn draw_count(&self) -> u64 {
        self.draws
    }

    pub fn clear_count(&self) -> u64 {
        self.clears
    }
}

impl RenderBackend for NullBackend {
    fn begin(&mut self) {}

    fn end(&mut self, draw: &DrawClause, _regs: &RegisterFile) {
        self.draws += 1;
        tracing::trace!(
            "null draw #{}: {:?} {:?}, {} elements",
            self.draws,
            draw.primitive,
            draw.command,
            draw.element_count()
        );
    }

    fn clear_surface(&mut self, mask: u32) {
        self.clears += 1;
        tracing::trace!("null clear, mask=0x{mask:02x}");
    }

    fn patch_transform_constants(&mut self, load_slot: u32, count: u32) {
        tracing::trace!("null constant patch: slots {load_slot}..{}", load_slot + count);
    }

    fn on_texture_dirty(&mut self, _unit: u32) {}

    fn on_vertex_texture_dirty(&mut self, _unit: u32) {}

    fn set_instanced(&mut self, _instanced: bool) {}

    fn flush(&mut self) {}
}
