//! Error types for the cellgx command processor
//!
//! None of these abort command processing: the register dispatch layer
//! converts every variant into a log line plus a local recovery action
//! (rollback, truncation, or a FIFO recovery request). Real hardware
//! silently survives the same malformed programming sequences.

use thiserror::Error;

/// Errors raised while processing the command stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("invalid encoding for register 0x{reg:04x}: 0x{value:08x}")]
    InvalidEncoding { reg: u32, value: u32 },

    #[error("write of {count} words at slot {offset} overflows {capacity}-slot bank")]
    OutOfRangeWrite { offset: u32, count: u32, capacity: u32 },

    #[error("resource offset 0x{offset:08x} not aligned to {align} bytes")]
    UnalignedResource { offset: u32, align: u32 },

    #[error("semaphore wait at 0x{addr:08x} timed out after {waited_us} us (expected 0x{expected:08x})")]
    Timeout { addr: u32, expected: u32, waited_us: u64 },

    #[error("resource address did not resolve: {0}")]
    BadResourceAddress(#[from] MemoryError),
}

/// Guest-memory access errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("invalid address: 0x{0:08x}")]
    InvalidAddress(u32),

    #[error("io offset 0x{0:08x} not mapped")]
    Unmapped(u32),

    #[error("alignment error: address 0x{addr:08x} not aligned to {align}")]
    AlignmentError { addr: u32, align: u32 },

    #[error("invalid DMA location: 0x{0:08x}")]
    InvalidLocation(u32),
}

/// Result type alias for processor operations
pub type Result<T> = std::result::Result<T, GpuError>;
