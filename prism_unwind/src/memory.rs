//! Word reads from stack memory.
//!
//! Resolving `Direct`/`Indirect` value locations and stepping frame-pointer
//! chains both need to read machine words out of a (possibly parked) thread's
//! stack. Routing every such read through [`FrameMemory`] keeps the raw
//! dereference in exactly one place.

use crate::error::{Result, UnwindError};

/// Source of 8-byte words at absolute addresses.
pub trait FrameMemory {
    /// Read the little-endian word stored at `addr`.
    fn read_word(&self, addr: u64) -> Result<u64>;
}

// =============================================================================
// NativeMemory
// =============================================================================

/// Reads from the current address space.
///
/// Only used on stacks that are either the caller's own or belong to a thread
/// parked at a global pause point, so the memory cannot change underneath.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeMemory;

impl NativeMemory {
    /// Lowest address considered readable; catches null-based locations.
    pub const MIN_ADDRESS: u64 = 0x1000;
}

impl FrameMemory for NativeMemory {
    #[inline]
    fn read_word(&self, addr: u64) -> Result<u64> {
        if addr < Self::MIN_ADDRESS || addr % 8 != 0 {
            return Err(UnwindError::InvalidMemoryRead(addr));
        }
        // SAFETY: the address is non-null and word aligned, and callers only
        // resolve locations taken from a stack map record that matches the
        // frame's current call site, so it names a live stack slot or spill.
        Ok(unsafe { std::ptr::read(addr as *const u64) })
    }
}

impl<M: FrameMemory + ?Sized> FrameMemory for &M {
    #[inline]
    fn read_word(&self, addr: u64) -> Result<u64> {
        (**self).read_word(addr)
    }
}

// =============================================================================
// Tests
// =============================================================================
