//! Generator return contexts.
//!
//! When a generator is resumed, the switch routine pushes the resumer's
//! callee-saved registers and return address onto the resumer's stack and
//! stores the resulting stack pointer in the generator object:
//!
//! ```text
//!   context address → ┌──────┐
//!                     │ r15  │ +0
//!                     │ r14  │ +8
//!                     │ r13  │ +16
//!                     │ r12  │ +24
//!                     │ rbx  │ +32
//!                     │ rbp  │ +40
//!                     │ rip  │ +48
//!   resumer rsp     → └──────┘ +56
//! ```
//!
//! The walker reads this block to continue a logical walk in the resumer
//! instead of the generator's physical caller.

use gimli::X86_64;

use crate::error::Result;
use crate::memory::FrameMemory;
use crate::registers::RegisterFile;

/// Saved state of the code that last resumed a generator.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReturnContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
}

impl ReturnContext {
    /// Size of the saved block on the stack.
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Read a context stored at `addr`.
    pub fn read<M: FrameMemory + ?Sized>(memory: &M, addr: u64) -> Result<Self> {
        let word = |i: u64| memory.read_word(addr + i * 8);
        Ok(Self {
            r15: word(0)?,
            r14: word(1)?,
            r13: word(2)?,
            r12: word(3)?,
            rbx: word(4)?,
            rbp: word(5)?,
            rip: word(6)?,
        })
    }

    /// Stack pointer of the resumer once the context is popped.
    #[inline]
    pub const fn resumer_sp(addr: u64) -> u64 {
        addr + Self::SIZE
    }

    /// Register file of the resumer frame.
    pub fn registers(&self, addr: u64) -> RegisterFile {
        let mut regs = RegisterFile::new();
        for (reg, value) in [
            (X86_64::R15, self.r15),
            (X86_64::R14, self.r14),
            (X86_64::R13, self.r13),
            (X86_64::R12, self.r12),
            (X86_64::RBX, self.rbx),
            (X86_64::RBP, self.rbp),
            (X86_64::RA, self.rip),
            (X86_64::RSP, Self::resumer_sp(addr)),
        ] {
            // All of these are inside the register file.
            let _ = regs.set(reg, value);
        }
        regs
    }

    /// The words in stack order, for writing a context into a test image.
    pub fn to_words(&self) -> [u64; 7] {
        [
            self.r15, self.r14, self.r13, self.r12, self.rbx, self.rbp, self.rip,
        ]
    }
}

// =============================================================================
// Tests
// =============================================================================
