//! Guest-visible memory for the cellgx command processor.
//!
//! The command processor shares this memory with other emulated execution
//! contexts: the FIFO producer writes command words into it and semaphore
//! values can be flipped by any thread at any time, with no wake
//! notification guaranteed. Every word is therefore an `AtomicU32`; the
//! processor uses acquire loads on watched locations and release stores
//! on values it publishes, plain relaxed accesses everywhere else.
//!
//! Addresses are guest byte addresses; all word accesses must be 4-byte
//! aligned. Out-of-range or misaligned accesses return `MemoryError`
//! rather than panicking, since command streams are adversarial.

pub mod dma;

use cgx_core::error::MemoryError;
use std::sync::atomic::{AtomicU32, Ordering};

pub use dma::{IoMapping, MemoryMap};

/// Bounds-checked, atomically accessed word store
pub struct GuestMemory {
    words: Box<[AtomicU32]>,
}

impl GuestMemory {
    /// Create a zero-filled store of at least `size_bytes` (rounded up to
    /// a whole word).
    pub fn new(size_bytes: u32) -> Self {
        let count = (size_bytes as usize).div_ceil(4);
        let words = (0..count)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { words }
    }

    /// Size of the store in bytes
    pub fn size_bytes(&self) -> u32 {
        (self.words.len() * 4) as u32
    }

    fn index(&self, addr: u32) -> Result<usize, MemoryError> {
        if addr % 4 != 0 {
            return Err(MemoryError::AlignmentError { addr, align: 4 });
        }
        let index = (addr / 4) as usize;
        if index >= self.words.len() {
            return Err(MemoryError::InvalidAddress(addr));
        }
        Ok(index)
    }

    /// Read a word with relaxed ordering
    pub fn read32(&self, addr: u32) -> Result<u32, MemoryError> {
        Ok(self.words[self.index(addr)?].load(Ordering::Relaxed))
    }

    /// Write a word with relaxed ordering
    pub fn write32(&self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.words[self.index(addr)?].store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Read a watched word with acquire ordering (semaphore polling)
    pub fn load_acquire(&self, addr: u32) -> Result<u32, MemoryError> {
        Ok(self.words[self.index(addr)?].load(Ordering::Acquire))
    }

    /// Publish a word with release ordering (semaphore/report values)
    pub fn store_release(&self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.words[self.index(addr)?].store(value, Ordering::Release);
        Ok(())
    }

    /// Write a 64-bit value as two words, high word at the lower address
    /// to match the guest's big-endian record layout.
    pub fn write64(&self, addr: u32, value: u64) -> Result<(), MemoryError> {
        let hi = self.index(addr)?;
        let lo = self.index(addr + 4)?;
        self.words[hi].store((value >> 32) as u32, Ordering::Relaxed);
        self.words[lo].store(value as u32, Ordering::Relaxed);
        Ok(())
    }

    /// Borrow a bounded view of up to `max_words` contiguous words
    /// starting at `addr`. The span is clamped to the end of the store;
    /// a shorter-than-requested span is a valid outcome, not an error.
    pub fn word_span(&self, addr: u32, max_words: u32) -> Result<WordSpan<'_>, MemoryError> {
        let start = self.index(addr)?;
        let end = (start + max_words as usize).min(self.words.len());
        Ok(WordSpan {
            words: &self.words[start..end],
        })
    }
}

/// A borrowed, bounds-checked window into the FIFO's backing store
pub struct WordSpan<'a> {
    words: &'a [AtomicU32],
}

impl WordSpan<'_> {
    pub fn len(&self) -> u32 {
        self.words.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Load the `i`-th word of the span
    pub fn get(&self, i: u32) -> u32 {
        self.words[i as usize].load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip() {
        let mem = GuestMemory::new(0x1000);
        mem.write32(0x100, 0xCAFEBABE).unwrap();
        assert_eq!(mem.read32(0x100).unwrap(), 0xCAFEBABE);
    }

    #[test]
    fn test_out_of_range() {
        let mem = GuestMemory::new(0x100);
        assert_eq!(
            mem.read32(0x100).unwrap_err(),
            MemoryError::InvalidAddress(0x100)
        );
    }

    #[test]
    fn test_misaligned_word() {
        let mem = GuestMemory::new(0x100);
        assert!(matches!(
            mem.read32(0x2).unwrap_err(),
            MemoryError::AlignmentError { addr: 0x2, align: 4 }
        ));
    }

    #[test]
    fn test_word_span_clamps_to_end() {
        let mem = GuestMemory::new(0x20);
        for i in 0..8u32 {
            mem.write32(i * 4, i).unwrap();
        }
        let span = mem.word_span(0x10, 16).unwrap();
        assert_eq!(span.len(), 4);
        assert_eq!(span.get(0), 4);
        assert_eq!(span.get(3), 7);
    }

    #[test]
    fn test_write64_big_endian_halves() {
        let mem = GuestMemory::new(0x100);
        mem.write64(0x10, 0x1122334455667788).unwrap();
        assert_eq!(mem.read32(0x10).unwrap(), 0x11223344);
        assert_eq!(mem.read32(0x14).unwrap(), 0x55667788);
    }
}
