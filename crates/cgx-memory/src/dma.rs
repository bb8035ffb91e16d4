//! Context-DMA address resolution.
//!
//! Register arguments never carry raw guest addresses; they carry an
//! offset plus a DMA-context selector. This module resolves the pair to
//! a guest address, or reports that the location is unmapped.

use cgx_core::error::MemoryError;
use parking_lot::RwLock;

pub const CELL_GCM_LOCATION_LOCAL: u32 = 0;
pub const CELL_GCM_LOCATION_MAIN: u32 = 1;
pub const CELL_GCM_CONTEXT_DMA_MEMORY_FRAME_BUFFER: u32 = 0xFEED0000;
pub const CELL_GCM_CONTEXT_DMA_MEMORY_HOST_BUFFER: u32 = 0xFEED0001;
pub const CELL_GCM_CONTEXT_DMA_REPORT_LOCATION_LOCAL: u32 = 0x66626660;
pub const CELL_GCM_CONTEXT_DMA_SEMAPHORE_RW: u32 = 0x66606660;
pub const CELL_GCM_CONTEXT_DMA_SEMAPHORE_R: u32 = 0x66606661;

/// Offset of the report area inside the label block
pub const REPORT_LOCAL_OFFSET: u32 = 0x1400;

/// A window of main memory made visible to the GPU at an IO offset
#[derive(Debug, Clone, Copy)]
pub struct IoMapping {
    pub io_base: u32,
    pub real_base: u32,
    pub size: u32,
}

/// Resolves (location, offset) pairs to guest addresses.
///
/// IO mappings are established by the embedder (the virtual-memory
/// subsystem on the real machine) and may change while the processor
/// runs, hence the lock.
pub struct MemoryMap {
    local_base: u32,
    label_base: u32,
    io: RwLock<Vec<IoMapping>>,
}

impl MemoryMap {
    pub fn new(local_base: u32, label_base: u32) -> Self {
        Self {
            local_base,
            label_base,
            io: RwLock::new(Vec::new()),
        }
    }

    pub fn local_base(&self) -> u32 {
        self.local_base
    }

    pub fn label_base(&self) -> u32 {
        self.label_base
    }

    /// Address of the flip semaphore, which gets special-cased handling
    pub fn flip_semaphore_addr(&self) -> u32 {
        self.label_base + 0x10
    }

    pub fn map_io(&self, mapping: IoMapping) {
        tracing::debug!(
            "io window: 0x{:08x}..0x{:08x} -> 0x{:08x}",
            mapping.io_base,
            mapping.io_base + mapping.size,
            mapping.real_base
        );
        self.io.write().push(mapping);
    }

    fn io_to_real(&self, offset: u32) -> Option<u32> {
        let io = self.io.read();
        io.iter()
            .find(|m| offset >= m.io_base && offset - m.io_base < m.size)
            .map(|m| m.real_base + (offset - m.io_base))
    }

    /// Resolve a DMA-context selector plus offset to a guest address
    pub fn resolve(&self, location: u32, offset: u32) -> Result<u32, MemoryError> {
        match location {
            CELL_GCM_LOCATION_LOCAL | CELL_GCM_CONTEXT_DMA_MEMORY_FRAME_BUFFER => {
                Ok(self.local_base + offset)
            }
            CELL_GCM_LOCATION_MAIN | CELL_GCM_CONTEXT_DMA_MEMORY_HOST_BUFFER => self
                .io_to_real(offset)
                .ok_or(MemoryError::Unmapped(offset)),
            CELL_GCM_CONTEXT_DMA_REPORT_LOCATION_LOCAL => {
                Ok(self.label_base + REPORT_LOCAL_OFFSET + offset)
            }
            CELL_GCM_CONTEXT_DMA_SEMAPHORE_RW | CELL_GCM_CONTEXT_DMA_SEMAPHORE_R => {
                Ok(self.label_base + offset)
            }
            _ => Err(MemoryError::InvalidLocation(location)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_resolution() {
        let map = MemoryMap::new(0x1000, 0x8000);
        assert_eq!(
            map.resolve(CELL_GCM_LOCATION_LOCAL, 0x200).unwrap(),
            0x1200
        );
        assert_eq!(
            map.resolve(CELL_GCM_CONTEXT_DMA_MEMORY_FRAME_BUFFER, 0x200)
                .unwrap(),
            0x1200
        );
    }

    #[test]
    fn test_semaphore_and_report_resolution() {
        let map = MemoryMap::new(0, 0x8000);
        assert_eq!(
            map.resolve(CELL_GCM_CONTEXT_DMA_SEMAPHORE_RW, 0x40).unwrap(),
            0x8040
        );
        assert_eq!(
            map.resolve(CELL_GCM_CONTEXT_DMA_REPORT_LOCATION_LOCAL, 0x10)
                .unwrap(),
            0x8000 + REPORT_LOCAL_OFFSET + 0x10
        );
    }

    #[test]
    fn test_unmapped_main_memory() {
        let map = MemoryMap::new(0, 0x8000);
        assert_eq!(
            map.resolve(CELL_GCM_LOCATION_MAIN, 0x100).unwrap_err(),
            MemoryError::Unmapped(0x100)
        );

        map.map_io(IoMapping {
            io_base: 0,
            real_base: 0x2000,
            size: 0x1000,
        });
        assert_eq!(map.resolve(CELL_GCM_LOCATION_MAIN, 0x100).unwrap(), 0x2100);
    }

    #[test]
    fn test_invalid_location() {
        let map = MemoryMap::new(0, 0x8000);
        assert_eq!(
            map.resolve(0xBAD, 0).unwrap_err(),
            MemoryError::InvalidLocation(0xBAD)
        );
    }
}
