//! The register file: latched context state plus decoded sub-state.
//!
//! Every register always holds some value; a rejected write rolls back
//! to the previous latch at the dispatch layer. Only the processing
//! thread ever touches this structure.

use bitflags::bitflags;

/// Number of addressable 32-bit registers (method offsets 0x0000..0x2000)
pub const REGISTER_COUNT: usize = 0x2000 / 4;

/// Transform-constant bank size in vec4 slots
pub const TRANSFORM_CONSTANT_SLOTS: usize = 468;

/// Transform-program memory size in instruction slots (4 words each)
pub const TRANSFORM_PROGRAM_SLOTS: usize = 512;

pub const FRAGMENT_TEXTURE_UNITS: usize = 16;
pub const VERTEX_TEXTURE_UNITS: usize = 4;
pub const VERTEX_ATTRIBUTES: usize = 16;

bitflags! {
    /// Dirty bits telling the renderer which cached state to reconsider
    /// before the next draw. Set here, cleared by the backend once it
    /// has reacted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PipelineDirty: u32 {
        /// Raster/blend/depth/stencil configuration changed
        const PIPELINE_CONFIG     = 1 << 0;
        /// Fragment program location or control changed
        const FRAGMENT_PROGRAM    = 1 << 1;
        /// Transform program memory or masks changed
        const VERTEX_PROGRAM      = 1 << 2;
        /// Transform-constant bank contents changed
        const TRANSFORM_CONSTANTS = 1 << 3;
        /// Vertex fetch configuration changed
        const VERTEX_STATE        = 1 << 4;
        /// Render surface configuration changed
        const SURFACE_CONFIG      = 1 << 5;
    }
}

/// The addressable state bank and its derived sub-state
pub struct RegisterFile {
    latch: Vec<u32>,
    pub dirty: PipelineDirty,
    pub fragment_textures_dirty: [bool; FRAGMENT_TEXTURE_UNITS],
    pub vertex_textures_dirty: [bool; VERTEX_TEXTURE_UNITS],
    /// Transform-constant bank, stored as raw words (4 per vec4 slot)
    pub transform_constants: Vec<u32>,
    /// Transform-program memory, stored as raw words (4 per instruction)
    pub transform_program: Vec<u32>,
    /// Word index the next transform-program write lands at; advances
    /// with each program word, reset by the program-load register
    pub transform_program_pointer: u32,
    /// Latched instancing characteristic of the bound vertex program
    pub vertex_program_instanced: bool,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self {
            latch: vec![0; REGISTER_COUNT],
            dirty: PipelineDirty::empty(),
            fragment_textures_dirty: [false; FRAGMENT_TEXTURE_UNITS],
            vertex_textures_dirty: [false; VERTEX_TEXTURE_UNITS],
            transform_constants: vec![0; TRANSFORM_CONSTANT_SLOTS * 4],
            transform_program: vec![0; TRANSFORM_PROGRAM_SLOTS * 4],
            transform_program_pointer: 0,
            vertex_program_instanced: false,
        }
    }

    /// Current latch of a register (method byte offset)
    #[inline]
    pub fn get(&self, reg: u32) -> u32 {
        self.latch[(reg >> 2) as usize]
    }

    /// Commit a value, returning the previous latch for rollback
    #[inline]
    pub fn commit(&mut self, reg: u32, value: u32) -> u32 {
        std::mem::replace(&mut self.latch[(reg >> 2) as usize], value)
    }

    /// Whether the register already holds `value`
    #[inline]
    pub fn test(&self, reg: u32, value: u32) -> bool {
        self.get(reg) == value
    }

    /// View the constant bank as floats (for backend consumption)
    pub fn transform_constants_f32(&self) -> &[f32] {
        bytemuck::cast_slice(&self.transform_constants)
    }

    /// Clear all dirty bits; called by the backend after it has reacted
    pub fn clear_dirty(&mut self) {
        self.dirty = PipelineDirty::empty();
        self.fragment_textures_dirty = [false; FRAGMENT_TEXTURE_UNITS];
        self.vertex_textures_dirty = [false; VERTEX_TEXTURE_UNITS];
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}
