//! Call frame information for native stepping.
//!
//! JIT output and the runtime's own code describe their frames with
//! `.eh_frame` data. [`CfiTable`] indexes every registered section by FDE
//! range, and one step applies a single unwind row to recover the caller's
//! registers, including the callee-saved ones a frame-pointer walk loses.
//!
//! ```text
//!   pc ──► section ──► FDE ──► row ──► CFA = reg + offset
//!                                      caller RSP = CFA
//!                                      caller reg = [CFA + n] | CFA + n
//!                                                 | other reg | unchanged
//! ```
//!
//! Callee-saved registers without a rule keep their value: the frame never
//! saved them, so it never changed them.

use std::sync::Arc;

use gimli::{
    BaseAddresses, CfaRule, CieOrFde, EhFrame, EhFrameOffset, EndianSlice, LittleEndian,
    RegisterRule, UnwindContext, UnwindSection, UnwindTableRow, X86_64,
};
use parking_lot::RwLock;

use crate::error::{Result, UnwindError};
use crate::memory::FrameMemory;
use crate::registers::{CALLEE_SAVED, REGISTER_COUNT, RegisterFile};

type EhSlice<'a> = EndianSlice<'a, LittleEndian>;

/// Scratch space for evaluating unwind rows, reused across steps.
pub type CfiScratch = UnwindContext<usize>;

fn eh_frame(bytes: &[u8]) -> EhFrame<EhSlice<'_>> {
    let mut section = EhFrame::new(bytes, LittleEndian);
    section.set_address_size(8);
    section
}

// =============================================================================
// CfiSection
// =============================================================================

/// Code range of one FDE and where it sits in its section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FdeRange {
    start: u64,
    end: u64,
    offset: usize,
}

/// One `.eh_frame` section and its FDE index.
#[derive(Debug)]
pub struct CfiSection {
    bytes: Box<[u8]>,
    bases: BaseAddresses,
    /// Sorted by start.
    fdes: Vec<FdeRange>,
}

impl CfiSection {
    /// Index `bytes`, an `.eh_frame` section loaded at `address`.
    pub fn new(bytes: impl Into<Box<[u8]>>, address: u64) -> Result<Self> {
        let bytes = bytes.into();
        let bases = BaseAddresses::default().set_eh_frame(address);

        let mut fdes = Vec::new();
        let section = eh_frame(&bytes);
        let mut entries = section.entries(&bases);
        while let Some(entry) = entries.next()? {
            if let CieOrFde::Fde(partial) = entry {
                let fde = partial.parse(EhFrame::cie_from_offset)?;
                fdes.push(FdeRange {
                    start: fde.initial_address(),
                    end: fde.initial_address().saturating_add(fde.len()),
                    offset: fde.offset(),
                });
            }
        }
        fdes.sort_by_key(|f| f.start);

        Ok(Self { bytes, bases, fdes })
    }

    /// Number of FDEs in the section.
    #[inline]
    pub fn len(&self) -> usize {
        self.fdes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fdes.is_empty()
    }

    /// Whether some FDE covers `pc`.
    #[inline]
    pub fn covers(&self, pc: u64) -> bool {
        self.find(pc).is_some()
    }

    fn find(&self, pc: u64) -> Option<&FdeRange> {
        let idx = self.fdes.partition_point(|f| f.start <= pc);
        let fde = self.fdes.get(idx.checked_sub(1)?)?;
        (pc < fde.end).then_some(fde)
    }

    /// Caller registers of a frame at `pc`, or `None` without a row for it.
    pub fn step(
        &self,
        scratch: &mut CfiScratch,
        pc: u64,
        regs: &RegisterFile,
        memory: &dyn FrameMemory,
    ) -> Result<Option<RegisterFile>> {
        let Some(range) = self.find(pc) else {
            return Ok(None);
        };
        let section = eh_frame(&self.bytes);
        let fde = section.fde_from_offset(
            &self.bases,
            EhFrameOffset(range.offset),
            EhFrame::cie_from_offset,
        )?;
        let row = match fde.unwind_info_for_address(&section, &self.bases, scratch, pc) {
            Ok(row) => row,
            Err(gimli::Error::NoUnwindInfoForAddress) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        apply_row(row, fde.cie().return_address_register(), pc, regs, memory).map(Some)
    }
}

/// Evaluate one unwind row against the current frame's registers.
fn apply_row(
    row: &UnwindTableRow<usize>,
    return_address_register: gimli::Register,
    pc: u64,
    regs: &RegisterFile,
    memory: &dyn FrameMemory,
) -> Result<RegisterFile> {
    let cfa = match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => {
            regs.get(*register)?.wrapping_add_signed(*offset)
        }
        _ => {
            return Err(UnwindError::UnsupportedCfi {
                pc,
                rule: "CFA expression",
            });
        }
    };

    let mut caller = RegisterFile::new();
    for reg in CALLEE_SAVED {
        if let Ok(value) = regs.get(reg) {
            caller.set(reg, value)?;
        }
    }

    for (reg, rule) in row.registers() {
        let reg = *reg;
        if reg.0 as usize >= REGISTER_COUNT {
            continue;
        }
        let value = match *rule {
            RegisterRule::Undefined => None,
            RegisterRule::SameValue => regs.get(reg).ok(),
            RegisterRule::Offset(n) => Some(memory.read_word(cfa.wrapping_add_signed(n))?),
            RegisterRule::ValOffset(n) => Some(cfa.wrapping_add_signed(n)),
            RegisterRule::Register(other) => regs.get(other).ok(),
            _ => {
                return Err(UnwindError::UnsupportedCfi {
                    pc,
                    rule: "register expression",
                });
            }
        };
        match value {
            Some(value) => caller.set(reg, value)?,
            None => caller.clear(reg),
        }
    }

    caller.set(X86_64::RSP, cfa)?;
    if return_address_register != X86_64::RA {
        match caller.get(return_address_register) {
            Ok(ra) => caller.set(X86_64::RA, ra)?,
            Err(_) => caller.clear(X86_64::RA),
        }
    }
    log::trace!("cfi step at {pc:#x}: cfa={cfa:#x} caller={caller:?}");
    Ok(caller)
}

// =============================================================================
// CfiTable
// =============================================================================

/// Every `.eh_frame` section the native cursor may step through.
///
/// The JIT registers a section next to each region it publishes; the
/// embedder registers the runtime's own section once at startup.
#[derive(Debug, Default)]
pub struct CfiTable {
    sections: RwLock<Vec<Arc<CfiSection>>>,
}

impl CfiTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a section.
    pub fn register(&self, section: CfiSection) -> Arc<CfiSection> {
        let section = Arc::new(section);
        log::debug!("registered CFI section with {} FDEs", section.len());
        self.sections.write().push(Arc::clone(&section));
        section
    }

    /// Remove a section previously returned by [`register`](Self::register).
    pub fn retire(&self, section: &Arc<CfiSection>) -> bool {
        let mut sections = self.sections.write();
        let before = sections.len();
        sections.retain(|s| !Arc::ptr_eq(s, section));
        sections.len() != before
    }

    /// Number of registered sections.
    pub fn len(&self) -> usize {
        self.sections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.read().is_empty()
    }

    /// Section covering `pc`.
    pub fn section_for(&self, pc: u64) -> Option<Arc<CfiSection>> {
        self.sections.read().iter().find(|s| s.covers(pc)).cloned()
    }

    /// Caller registers of a frame at `pc`, or `None` when no section
    /// describes it.
    pub fn step(
        &self,
        scratch: &mut CfiScratch,
        pc: u64,
        regs: &RegisterFile,
        memory: &dyn FrameMemory,
    ) -> Result<Option<RegisterFile>> {
        match self.section_for(pc) {
            Some(section) => section.step(scratch, pc, regs, memory),
            None => Ok(None),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cursor::SnapshotMemory;
    use gimli::write::{
        Address, CallFrameInstruction, CommonInformationEntry, EhFrame as EhFrameWriter,
        EndianVec, FrameDescriptionEntry, FrameTable,
    };
    use gimli::{Encoding, Format};

    /// `.eh_frame` for one function at `start` with the usual prologue:
    ///
    /// ```text
    ///   +0  push rbp
    ///   +1  mov rbp, rsp
    ///   +4  push rbx
    ///   +8  ... body ...
    /// ```
    pub(crate) fn prologue_eh_frame(start: u64, len: u32) -> Vec<u8> {
        let encoding = Encoding {
            address_size: 8,
            format: Format::Dwarf32,
            version: 1,
        };
        let mut cie = CommonInformationEntry::new(encoding, 1, -8, X86_64::RA);
        cie.add_instruction(CallFrameInstruction::Cfa(X86_64::RSP, 8));
        cie.add_instruction(CallFrameInstruction::Offset(X86_64::RA, -8));

        let mut fde = FrameDescriptionEntry::new(Address::Constant(start), len);
        fde.add_instruction(1, CallFrameInstruction::CfaOffset(16));
        fde.add_instruction(1, CallFrameInstruction::Offset(X86_64::RBP, -16));
        fde.add_instruction(4, CallFrameInstruction::CfaRegister(X86_64::RBP));
        fde.add_instruction(8, CallFrameInstruction::Offset(X86_64::RBX, -24));

        let mut table = FrameTable::default();
        let cie_id = table.add_cie(cie);
        table.add_fde(cie_id, fde);
        let mut out = EhFrameWriter(EndianVec::new(LittleEndian));
        table.write_eh_frame(&mut out).unwrap();
        out.0.into_vec()
    }

    fn table() -> CfiTable {
        let table = CfiTable::new();
        table.register(CfiSection::new(prologue_eh_frame(0x1000, 0x100), 0x40_0000).unwrap());
        table
    }

    #[test]
    fn test_section_index() {
        let section = CfiSection::new(prologue_eh_frame(0x1000, 0x100), 0x40_0000).unwrap();
        assert_eq!(section.len(), 1);
        assert!(section.covers(0x1000));
        assert!(section.covers(0x10FF));
        assert!(!section.covers(0x1100));
        assert!(!section.covers(0xFFF));
    }

    #[test]
    fn test_body_row_restores_saved_registers() {
        let mut regs = RegisterFile::new();
        regs.set(X86_64::RSP, 0x6fe0).unwrap();
        regs.set(X86_64::RBP, 0x7000).unwrap();
        regs.set(X86_64::RBX, 0x1).unwrap();
        regs.set(X86_64::R12, 0xC12).unwrap();
        regs.set(X86_64::RAX, 0xAA).unwrap();

        let mut mem = SnapshotMemory::new();
        mem.write_word(0x7008, 0x2222);
        mem.write_word(0x7000, 0x7100);
        mem.write_word(0x6ff8, 0xB0B);

        let mut scratch = CfiScratch::new();
        let caller = table()
            .step(&mut scratch, 0x1040, &regs, &mem)
            .unwrap()
            .unwrap();
        assert_eq!(caller.get(X86_64::RSP), Ok(0x7010));
        assert_eq!(caller.get(X86_64::RBP), Ok(0x7100));
        assert_eq!(caller.get(X86_64::RA), Ok(0x2222));
        assert_eq!(caller.get(X86_64::RBX), Ok(0xB0B));
        // Never saved, so never changed.
        assert_eq!(caller.get(X86_64::R12), Ok(0xC12));
        // Caller-saved registers do not survive the call.
        assert_eq!(
            caller.get(X86_64::RAX),
            Err(UnwindError::RegisterUnavailable(0))
        );
    }

    #[test]
    fn test_first_instruction_uses_stack_pointer() {
        let mut regs = RegisterFile::new();
        regs.set(X86_64::RSP, 0x6ff0).unwrap();
        regs.set(X86_64::RBP, 0x7000).unwrap();
        let mut mem = SnapshotMemory::new();
        mem.write_word(0x6ff0, 0x3333);

        let mut scratch = CfiScratch::new();
        let caller = table()
            .step(&mut scratch, 0x1000, &regs, &mem)
            .unwrap()
            .unwrap();
        assert_eq!(caller.get(X86_64::RA), Ok(0x3333));
        assert_eq!(caller.get(X86_64::RSP), Ok(0x6ff8));
        assert_eq!(caller.get(X86_64::RBP), Ok(0x7000));
    }

    #[test]
    fn test_uncovered_pc_has_no_row() {
        let regs = RegisterFile::new();
        let mut scratch = CfiScratch::new();
        let step = table().step(&mut scratch, 0x9000, &regs, &SnapshotMemory::new());
        assert_eq!(step, Ok(None));
    }

    #[test]
    fn test_retire_section() {
        let table = CfiTable::new();
        let section =
            table.register(CfiSection::new(prologue_eh_frame(0x1000, 0x100), 0).unwrap());
        assert!(table.section_for(0x1010).is_some());
        assert!(table.retire(&section));
        assert!(table.section_for(0x1010).is_none());
        assert!(!table.retire(&section));
    }
}
