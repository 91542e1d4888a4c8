//! Value locations inside stack map records.
//!
//! Each location is a fixed 8-byte tuple on the wire:
//!
//! ```text
//! ┌────────┬────────┬──────────────┬──────────────────────────┐
//! │ type   │ flags  │ regnum (u16) │ offset / payload (i32)   │
//! └────────┴────────┴──────────────┴──────────────────────────┘
//! ```

use gimli::Register;

use crate::error::{Result, UnwindError};
use crate::memory::FrameMemory;
use crate::registers::RegisterFile;

// =============================================================================
// Wire Tags
// =============================================================================

/// Value lives in a register.
pub const LOC_REGISTER: u8 = 1;
/// Value lives in the frame slot at `reg + offset`.
pub const LOC_DIRECT: u8 = 2;
/// Value is reached through the pointer `reg + offset`.
pub const LOC_INDIRECT: u8 = 3;
/// Value is the inline 32-bit constant.
pub const LOC_CONSTANT: u8 = 4;
/// Value is an entry in the stack map's constant pool.
pub const LOC_CONST_INDEX: u8 = 5;

/// Size of one encoded location tuple.
pub const LOCATION_SIZE: usize = 8;

// =============================================================================
// ValueLocation
// =============================================================================

/// Where a live value can be found at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueLocation {
    /// Register `n` holds the value.
    Register(Register),
    /// The value is spilled to the frame slot at `reg + offset`.
    ///
    /// Resolves exactly like [`Indirect`](Self::Indirect): both read the
    /// one word at `reg + offset`. The tags are kept apart only because
    /// the code generator emits both.
    Direct { reg: Register, offset: i32 },
    /// The value is stored in memory at `reg + offset`.
    Indirect { reg: Register, offset: i32 },
    /// Inline constant (sign-extended).
    Constant(i64),
    /// Index into the owning stack map's constant pool.
    ConstPoolIndex(u32),
}

impl ValueLocation {
    /// Decode one location from its wire tuple.
    pub fn from_raw(kind: u8, regnum: u16, offset: i32) -> Result<Self> {
        let reg = Register(regnum);
        Ok(match kind {
            LOC_REGISTER => Self::Register(reg),
            LOC_DIRECT => Self::Direct { reg, offset },
            LOC_INDIRECT => Self::Indirect { reg, offset },
            LOC_CONSTANT => Self::Constant(offset as i64),
            LOC_CONST_INDEX => {
                if offset < 0 {
                    return Err(UnwindError::ConstantOutOfRange {
                        index: offset as usize,
                        len: 0,
                    });
                }
                Self::ConstPoolIndex(offset as u32)
            }
            other => return Err(UnwindError::UnknownLocationType(other)),
        })
    }

    /// Encode as `(type, regnum, offset)`.
    pub fn to_raw(self) -> (u8, u16, i32) {
        match self {
            Self::Register(reg) => (LOC_REGISTER, reg.0, 0),
            Self::Direct { reg, offset } => (LOC_DIRECT, reg.0, offset),
            Self::Indirect { reg, offset } => (LOC_INDIRECT, reg.0, offset),
            Self::Constant(value) => (LOC_CONSTANT, 0, value as i32),
            Self::ConstPoolIndex(index) => (LOC_CONST_INDEX, 0, index as i32),
        }
    }

    /// Whether resolving this location reads memory.
    #[inline]
    pub const fn reads_memory(&self) -> bool {
        matches!(self, Self::Direct { .. } | Self::Indirect { .. })
    }

    /// Resolve against a frame's register snapshot.
    ///
    /// `constants` must be the constant pool of the same compiled version the
    /// record came from.
    pub fn resolve<M: FrameMemory>(
        &self,
        regs: &RegisterFile,
        constants: &[u64],
        memory: &M,
    ) -> Result<u64> {
        match *self {
            Self::Register(reg) => regs.get(reg),
            Self::Direct { reg, offset } | Self::Indirect { reg, offset } => {
                let base = regs.get(reg)?;
                memory.read_word(base.wrapping_add_signed(offset as i64))
            }
            Self::Constant(value) => Ok(value as u64),
            Self::ConstPoolIndex(index) => constants.get(index as usize).copied().ok_or(
                UnwindError::ConstantOutOfRange {
                    index: index as usize,
                    len: constants.len(),
                },
            ),
        }
    }
}

// =============================================================================
// LiveOut
// =============================================================================

/// A register live across the call site (recorded, not consumed for deopt).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveOut {
    /// DWARF register number.
    pub reg: Register,
    /// Size in bytes of the live value.
    pub size: u8,
}

/// Size of one encoded live-out tuple.
pub const LIVE_OUT_SIZE: usize = 4;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use gimli::X86_64;
    use rustc_hash::FxHashMap;

    struct MapMemory(FxHashMap<u64, u64>);

    impl FrameMemory for MapMemory {
        fn read_word(&self, addr: u64) -> Result<u64> {
            self.0
                .get(&addr)
                .copied()
                .ok_or(UnwindError::InvalidMemoryRead(addr))
        }
    }

    #[test]
    fn test_raw_round_trip_each_kind() {
        let locations = [
            ValueLocation::Register(X86_64::RBX),
            ValueLocation::Direct {
                reg: X86_64::RBP,
                offset: -24,
            },
            ValueLocation::Indirect {
                reg: X86_64::RSP,
                offset: 8,
            },
            ValueLocation::Constant(-5),
            ValueLocation::ConstPoolIndex(3),
        ];
        for loc in locations {
            let (kind, reg, offset) = loc.to_raw();
            assert_eq!(ValueLocation::from_raw(kind, reg, offset), Ok(loc));
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert_eq!(
            ValueLocation::from_raw(9, 0, 0),
            Err(UnwindError::UnknownLocationType(9))
        );
    }

    #[test]
    fn test_direct_reads_frame_slot() {
        let mut regs = RegisterFile::new();
        regs.set(X86_64::RBP, 0x7000).unwrap();
        let mut mem = FxHashMap::default();
        mem.insert(0x7010, 0xABCD);
        let loc = ValueLocation::Direct {
            reg: X86_64::RBP,
            offset: 16,
        };
        let mem = MapMemory(mem);
        assert_eq!(loc.resolve(&regs, &[], &mem), Ok(0xABCD));

        let indirect = ValueLocation::Indirect {
            reg: X86_64::RBP,
            offset: 16,
        };
        assert_eq!(indirect.resolve(&regs, &[], &mem), Ok(0xABCD));
    }

    #[test]
    fn test_register_constant_and_pool() {
        let mut regs = RegisterFile::new();
        regs.set(X86_64::R12, 77).unwrap();
        let mem = MapMemory(FxHashMap::default());
        let pool = [10, 20, 30];

        assert_eq!(
            ValueLocation::Register(X86_64::R12).resolve(&regs, &pool, &mem),
            Ok(77)
        );
        assert_eq!(
            ValueLocation::Constant(-1).resolve(&regs, &pool, &mem),
            Ok(u64::MAX)
        );
        assert_eq!(
            ValueLocation::ConstPoolIndex(2).resolve(&regs, &pool, &mem),
            Ok(30)
        );
        assert_eq!(
            ValueLocation::ConstPoolIndex(3).resolve(&regs, &pool, &mem),
            Err(UnwindError::ConstantOutOfRange { index: 3, len: 3 })
        );
    }

    #[test]
    fn test_missing_register_is_error() {
        let regs = RegisterFile::new();
        let mem = MapMemory(FxHashMap::default());
        let loc = ValueLocation::Indirect {
            reg: X86_64::R13,
            offset: 0,
        };
        assert_eq!(
            loc.resolve(&regs, &[], &mem),
            Err(UnwindError::RegisterUnavailable(13))
        );
    }
}
