//! x64 register file in DWARF numbering.
//!
//! Stack maps, LSDA landing conventions and the stepping primitive all name
//! registers by their DWARF number (`gimli::X86_64`), which differs from the
//! hardware encoding order used by the assembler:
//!
//! | DWARF | Register | Callee-saved |
//! |-------|----------|--------------|
//! | 0     | RAX      |              |
//! | 1     | RDX      |              |
//! | 2     | RCX      |              |
//! | 3     | RBX      | yes          |
//! | 4     | RSI      |              |
//! | 5     | RDI      |              |
//! | 6     | RBP      | yes          |
//! | 7     | RSP      |              |
//! | 8-15  | R8-R15   | R12-R15      |
//! | 16    | RA       |              |

use std::fmt;

use gimli::{Register, X86_64};

use crate::error::{Result, UnwindError};

// =============================================================================
// Constants
// =============================================================================

/// Number of tracked DWARF registers (RAX..R15 plus the return address).
pub const REGISTER_COUNT: usize = 17;

/// Callee-saved registers under the System V x64 ABI.
pub const CALLEE_SAVED: [Register; 6] = [
    X86_64::RBX,
    X86_64::RBP,
    X86_64::R12,
    X86_64::R13,
    X86_64::R14,
    X86_64::R15,
];

/// Register carrying the exception payload pointer into a landing pad.
pub const EH_DATA_PAYLOAD: Register = X86_64::RAX;

/// Register carrying the action selector into a landing pad.
pub const EH_DATA_SELECTOR: Register = X86_64::RDX;

/// Short lowercase name of a DWARF register, for diagnostics.
pub fn register_name(reg: Register) -> &'static str {
    X86_64::register_name(reg).unwrap_or("?")
}

// =============================================================================
// RegisterFile
// =============================================================================

/// Register values captured for one frame.
///
/// Slots that the stepping primitive could not recover stay `None`; reading
/// them is an error rather than a silent zero.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterFile {
    slots: [Option<u64>; REGISTER_COUNT],
}

impl RegisterFile {
    /// Create an empty register file.
    #[inline]
    pub const fn new() -> Self {
        Self {
            slots: [None; REGISTER_COUNT],
        }
    }

    /// Get a register value.
    #[inline]
    pub fn get(&self, reg: Register) -> Result<u64> {
        self.slots
            .get(reg.0 as usize)
            .ok_or(UnwindError::BadRegisterNumber(reg.0))?
            .ok_or(UnwindError::RegisterUnavailable(reg.0))
    }

    /// Set a register value. Out-of-range registers are rejected.
    #[inline]
    pub fn set(&mut self, reg: Register, value: u64) -> Result<()> {
        let slot = self
            .slots
            .get_mut(reg.0 as usize)
            .ok_or(UnwindError::BadRegisterNumber(reg.0))?;
        *slot = Some(value);
        Ok(())
    }

    /// Mark a register as unavailable.
    #[inline]
    pub fn clear(&mut self, reg: Register) {
        if let Some(slot) = self.slots.get_mut(reg.0 as usize) {
            *slot = None;
        }
    }

    /// Check whether a register holds a recovered value.
    #[inline]
    pub fn is_available(&self, reg: Register) -> bool {
        matches!(self.slots.get(reg.0 as usize), Some(Some(_)))
    }

    /// Number of registers with recovered values.
    #[inline]
    pub fn available_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Iterate over `(register, value)` pairs that are available.
    pub fn iter(&self) -> impl Iterator<Item = (Register, u64)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (Register(i as u16), v)))
    }
}

impl fmt::Debug for RegisterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (reg, value) in self.iter() {
            map.entry(&register_name(reg), &format_args!("{value:#x}"));
        }
        map.finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
