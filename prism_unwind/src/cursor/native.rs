//! Native stack stepping over a live stack.
//!
//! Each step first asks the [`CfiTable`] for an unwind row covering the
//! frame. A row recovers the caller's stack pointer, return address and
//! every callee-saved register the frame spilled. Frames without CFI fall
//! back to the frame-pointer record every JIT frame and runtime function
//! carries:
//!
//! ```text
//!   rbp + 8  → return address into the caller
//!   rbp      → caller's rbp
//! ```
//!
//! The fallback cannot see where RBX or R12-R15 were spilled, so a caller
//! reached through it has those registers unavailable and cannot be
//! resumed. [`StackCursor::resume`] refuses rather than land with guesses.

use std::fmt;
use std::sync::Arc;

use gimli::{Register, X86_64};

use super::StackCursor;
use super::cfi::{CfiScratch, CfiTable};
use crate::error::{Result, UnwindError};
use crate::generator::ReturnContext;
use crate::memory::{FrameMemory, NativeMemory};
use crate::registers::{CALLEE_SAVED, REGISTER_COUNT, RegisterFile};

/// Cursor over a live stack, stepping by CFI with a frame-pointer fallback.
pub struct NativeCursor<M: FrameMemory = NativeMemory> {
    memory: M,
    cfi: Arc<CfiTable>,
    scratch: Box<CfiScratch>,
    regs: RegisterFile,
    ip: u64,
    sp: u64,
    bp: u64,
    /// `ip` is the instruction itself rather than a return address.
    exact_pc: bool,
    /// The initial frame has been yielded.
    primed: bool,
    done: bool,
}

impl<M: FrameMemory> NativeCursor<M> {
    /// Start a walk whose innermost frame has the given state.
    pub fn new(memory: M, cfi: Arc<CfiTable>, ip: u64, sp: u64, bp: u64) -> Self {
        let mut regs = RegisterFile::new();
        let _ = regs.set(X86_64::RA, ip);
        let _ = regs.set(X86_64::RSP, sp);
        let _ = regs.set(X86_64::RBP, bp);
        Self {
            memory,
            cfi,
            scratch: Box::new(CfiScratch::new()),
            regs,
            ip,
            sp,
            bp,
            exact_pc: false,
            primed: false,
            done: false,
        }
    }

    /// Seed a register of the innermost frame.
    pub fn with_register(mut self, reg: Register, value: u64) -> Self {
        let _ = self.set_register(reg, value);
        self
    }

    /// The innermost `ip` is the current instruction, not a return address.
    pub fn at_exact_pc(mut self) -> Self {
        self.exact_pc = true;
        self
    }

    /// Caller registers from the frame-pointer record alone.
    fn frame_pointer_step(&self) -> Result<Option<RegisterFile>> {
        if self.bp == 0 {
            return Ok(None);
        }
        let caller_bp = self.memory.read_word(self.bp)?;
        let return_address = self.memory.read_word(self.bp + 8)?;
        if return_address == 0 {
            return Ok(None);
        }
        if caller_bp != 0 && caller_bp <= self.bp {
            return Err(UnwindError::StepFailed {
                ip: self.ip,
                reason: "frame pointer chain is not ascending",
            });
        }

        let mut caller = RegisterFile::new();
        caller.set(X86_64::RBP, caller_bp)?;
        caller.set(X86_64::RSP, self.bp + 16)?;
        caller.set(X86_64::RA, return_address)?;
        Ok(Some(caller))
    }
}

impl NativeCursor<NativeMemory> {
    /// Begin a walk at the instruction that called this function.
    ///
    /// Always inlined so the captured registers belong to the caller's own
    /// frame, which becomes the innermost frame of the walk.
    #[cfg(target_arch = "x86_64")]
    #[inline(always)]
    pub fn capture(cfi: Arc<CfiTable>) -> Result<Self> {
        let (ip, sp, bp): (u64, u64, u64);
        let (rbx, r12, r13, r14, r15): (u64, u64, u64, u64, u64);
        // SAFETY: copies registers into locals; touches no memory. Outputs
        // are pinned to caller-saved registers so no source is overwritten
        // before it is read.
        unsafe {
            std::arch::asm!(
                "lea rax, [rip]",
                "mov rcx, rsp",
                "mov rdx, rbp",
                "mov rsi, rbx",
                "mov rdi, r12",
                "mov r8, r13",
                "mov r9, r14",
                "mov r10, r15",
                out("rax") ip,
                out("rcx") sp,
                out("rdx") bp,
                out("rsi") rbx,
                out("rdi") r12,
                out("r8") r13,
                out("r9") r14,
                out("r10") r15,
                options(nomem, nostack, preserves_flags),
            );
        }
        Ok(Self::new(NativeMemory, cfi, ip, sp, bp)
            .with_register(X86_64::RBX, rbx)
            .with_register(X86_64::R12, r12)
            .with_register(X86_64::R13, r13)
            .with_register(X86_64::R14, r14)
            .with_register(X86_64::R15, r15)
            .at_exact_pc())
    }

    /// Begin a walk at the instruction that called this function.
    #[cfg(not(target_arch = "x86_64"))]
    pub fn capture(_cfi: Arc<CfiTable>) -> Result<Self> {
        Err(UnwindError::UnsupportedTarget)
    }
}

impl<M: FrameMemory> fmt::Debug for NativeCursor<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCursor")
            .field("ip", &format_args!("{:#x}", self.ip))
            .field("sp", &format_args!("{:#x}", self.sp))
            .field("bp", &format_args!("{:#x}", self.bp))
            .field("regs", &self.regs)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<M: FrameMemory> StackCursor for NativeCursor<M> {
    fn step(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        if !self.primed {
            self.primed = true;
            self.done = self.ip == 0;
            return Ok(!self.done);
        }

        let pc = self.lookup_pc();
        let caller = match self.cfi.step(&mut self.scratch, pc, &self.regs, &self.memory)? {
            Some(caller) => caller,
            None => match self.frame_pointer_step()? {
                Some(caller) => caller,
                None => {
                    self.done = true;
                    return Ok(false);
                }
            },
        };

        // An undefined return address marks the outermost frame.
        let ip = match caller.get(X86_64::RA) {
            Ok(ip) if ip != 0 => ip,
            _ => {
                self.done = true;
                return Ok(false);
            }
        };
        let sp = caller.get(X86_64::RSP)?;
        if sp <= self.sp {
            return Err(UnwindError::StepFailed {
                ip: self.ip,
                reason: "stack pointer did not advance",
            });
        }

        self.ip = ip;
        self.sp = sp;
        self.bp = caller.get(X86_64::RBP).unwrap_or(0);
        self.regs = caller;
        self.exact_pc = false;
        Ok(true)
    }

    #[inline]
    fn ip(&self) -> u64 {
        self.ip
    }

    #[inline]
    fn sp(&self) -> u64 {
        self.sp
    }

    #[inline]
    fn bp(&self) -> u64 {
        self.bp
    }

    fn lookup_pc(&self) -> u64 {
        if self.exact_pc {
            self.ip
        } else {
            self.ip.saturating_sub(1)
        }
    }

    #[inline]
    fn register(&self, reg: Register) -> Result<u64> {
        self.regs.get(reg)
    }

    fn set_register(&mut self, reg: Register, value: u64) -> Result<()> {
        self.regs.set(reg, value)?;
        match reg {
            X86_64::RSP => self.sp = value,
            X86_64::RBP => self.bp = value,
            X86_64::RA => self.ip = value,
            _ => {}
        }
        Ok(())
    }

    fn set_ip(&mut self, ip: u64) {
        self.ip = ip;
        self.exact_pc = true;
        let _ = self.regs.set(X86_64::RA, ip);
    }

    fn reanchor(&mut self, context_address: u64) -> Result<()> {
        let ctx = ReturnContext::read(&self.memory, context_address)?;
        self.regs = ctx.registers(context_address);
        self.ip = ctx.rip;
        self.bp = ctx.rbp;
        self.sp = ReturnContext::resumer_sp(context_address);
        self.exact_pc = false;
        self.primed = true;
        self.done = false;
        Ok(())
    }

    fn memory(&self) -> &dyn FrameMemory {
        &self.memory
    }

    unsafe fn resume(&mut self) -> Result<()> {
        if let Some(reg) = CALLEE_SAVED.into_iter().find(|r| !self.regs.is_available(*r)) {
            return Err(UnwindError::IncompleteRegisterState {
                ip: self.ip,
                reg: reg.0,
            });
        }
        let mut words = [0u64; REGISTER_COUNT];
        for (reg, value) in self.regs.iter() {
            words[reg.0 as usize] = value;
        }
        words[X86_64::RA.0 as usize] = self.ip;
        words[X86_64::RSP.0 as usize] = self.sp;
        words[X86_64::RBP.0 as usize] = self.bp;
        log::trace!("landing at {:#x} with {:?}", self.ip, self.regs);
        // SAFETY: forwarded from the caller's contract.
        unsafe { land(&words) }
    }
}

/// Load the register block (DWARF order, 8 bytes per register) and jump to
/// its return-address slot.
#[cfg(target_arch = "x86_64")]
unsafe fn land(words: &[u64; REGISTER_COUNT]) -> ! {
    // SAFETY: the caller guarantees the target frame is live and expects
    // exactly this register state. The jump target is read into rcx before
    // rsp moves, so nothing is read from the abandoned stack afterwards.
    unsafe {
        std::arch::asm!(
            "mov rcx, [rdi + 128]",
            "mov rax, [rdi + 0]",
            "mov rdx, [rdi + 8]",
            "mov rbx, [rdi + 24]",
            "mov rsi, [rdi + 32]",
            "mov rbp, [rdi + 48]",
            "mov r8,  [rdi + 64]",
            "mov r9,  [rdi + 72]",
            "mov r10, [rdi + 80]",
            "mov r11, [rdi + 88]",
            "mov r12, [rdi + 96]",
            "mov r13, [rdi + 104]",
            "mov r14, [rdi + 112]",
            "mov r15, [rdi + 120]",
            "mov rsp, [rdi + 56]",
            "jmp rcx",
            in("rdi") words.as_ptr(),
            options(noreturn),
        )
    }
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn land(_words: &[u64; REGISTER_COUNT]) -> ! {
    crate::error::fatal(&UnwindError::UnsupportedTarget, None, None)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::SnapshotMemory;
    use crate::cursor::cfi::CfiSection;
    use crate::cursor::cfi::tests::prologue_eh_frame;

    /// Three frames: 0x7000 → 0x7100 → 0x7200 → end.
    fn chain() -> SnapshotMemory {
        let mut mem = SnapshotMemory::new();
        mem.write_word(0x7000, 0x7100);
        mem.write_word(0x7008, 0x2222);
        mem.write_word(0x7100, 0x7200);
        mem.write_word(0x7108, 0x3333);
        mem.write_word(0x7200, 0);
        mem.write_word(0x7208, 0);
        mem
    }

    /// CFI for a function at [0x1000, 0x1100) that spills RBX.
    fn cfi() -> Arc<CfiTable> {
        let table = CfiTable::new();
        table.register(CfiSection::new(prologue_eh_frame(0x1000, 0x100), 0x40_0000).unwrap());
        Arc::new(table)
    }

    fn saved_registers(cursor: NativeCursor<SnapshotMemory>) -> NativeCursor<SnapshotMemory> {
        cursor
            .with_register(X86_64::RBX, 0x1)
            .with_register(X86_64::R12, 0xC12)
            .with_register(X86_64::R13, 0xC13)
            .with_register(X86_64::R14, 0xC14)
            .with_register(X86_64::R15, 0xC15)
    }

    #[test]
    fn test_walks_frame_pointer_chain() {
        let mut cursor = NativeCursor::new(chain(), Arc::default(), 0x1111, 0x6f00, 0x7000);
        let mut seen = Vec::new();
        while cursor.step().unwrap() {
            seen.push((cursor.ip(), cursor.sp(), cursor.bp()));
        }
        assert_eq!(
            seen,
            vec![
                (0x1111, 0x6f00, 0x7000),
                (0x2222, 0x7010, 0x7100),
                (0x3333, 0x7110, 0x7200),
            ]
        );
        assert!(!cursor.step().unwrap());
    }

    #[test]
    fn test_frame_pointer_step_drops_spillable_registers() {
        let cursor = NativeCursor::new(chain(), Arc::default(), 0x1111, 0x6f00, 0x7000);
        let mut cursor = saved_registers(cursor);
        cursor.step().unwrap();
        cursor.step().unwrap();
        assert_eq!(cursor.register(X86_64::RBP), Ok(0x7100));
        assert_eq!(cursor.register(X86_64::RA), Ok(0x2222));
        assert_eq!(
            cursor.register(X86_64::RBX),
            Err(UnwindError::RegisterUnavailable(3))
        );
        assert_eq!(cursor.registers().available_count(), 3);
    }

    #[test]
    fn test_cfi_step_recovers_callee_saved() {
        let mut mem = chain();
        // Function at 0x1000 spilled the caller's RBX below its saved RBP.
        mem.write_word(0x6ff8, 0xB0B);
        let cursor = NativeCursor::new(mem, cfi(), 0x1040, 0x6fe0, 0x7000).at_exact_pc();
        let mut cursor = saved_registers(cursor);

        assert!(cursor.step().unwrap());
        assert_eq!(cursor.lookup_pc(), 0x1040);
        assert!(cursor.step().unwrap());
        assert_eq!((cursor.ip(), cursor.sp(), cursor.bp()), (0x2222, 0x7010, 0x7100));
        assert_eq!(cursor.lookup_pc(), 0x2221);
        assert_eq!(cursor.register(X86_64::RBX), Ok(0xB0B));
        assert_eq!(cursor.register(X86_64::R12), Ok(0xC12));
        assert_eq!(cursor.register(X86_64::R15), Ok(0xC15));
        assert_eq!(
            cursor.register(X86_64::RAX),
            Err(UnwindError::RegisterUnavailable(0))
        );

        // 0x2222 has no CFI; the frame-pointer record takes over.
        assert!(cursor.step().unwrap());
        assert_eq!(cursor.ip(), 0x3333);
        assert!(!cursor.registers().is_available(X86_64::RBX));
    }

    #[test]
    fn test_return_address_past_fde_end_uses_call_site() {
        let mut mem = SnapshotMemory::new();
        mem.write_word(0x6ff8, 0xB0B);
        mem.write_word(0x7000, 0x7100);
        mem.write_word(0x7008, 0x5555);
        mem.write_word(0x7100, 0);
        mem.write_word(0x7108, 0);
        // A frame whose return address is the first byte after the FDE.
        let mut cursor = NativeCursor::new(mem, cfi(), 0x1100, 0x6fe0, 0x7000);
        cursor.step().unwrap();
        assert_eq!(cursor.lookup_pc(), 0x10FF);
        assert!(cursor.step().unwrap());
        assert_eq!(cursor.ip(), 0x5555);
        assert_eq!(cursor.register(X86_64::RBX), Ok(0xB0B));
    }

    #[test]
    fn test_resume_refuses_unrecovered_callee_saved() {
        let cursor = NativeCursor::new(chain(), Arc::default(), 0x1111, 0x6f00, 0x7000);
        let mut cursor = saved_registers(cursor);
        cursor.step().unwrap();
        cursor.step().unwrap();
        cursor.set_ip(0x2280);
        // SAFETY: refused before any register is loaded.
        let result = unsafe { cursor.resume() };
        assert_eq!(
            result,
            Err(UnwindError::IncompleteRegisterState { ip: 0x2280, reg: 3 })
        );
    }

    #[test]
    fn test_descending_chain_rejected() {
        let mut mem = SnapshotMemory::new();
        mem.write_word(0x7000, 0x6000);
        mem.write_word(0x7008, 0x2222);
        let mut cursor = NativeCursor::new(mem, Arc::default(), 0x1111, 0x6f00, 0x7000);
        assert!(cursor.step().unwrap());
        assert!(matches!(
            cursor.step(),
            Err(UnwindError::StepFailed { .. })
        ));
    }

    #[test]
    fn test_reanchor_to_return_context() {
        let mut mem = chain();
        let ctx = ReturnContext {
            r12: 0xC12,
            rbx: 0xB,
            rbp: 0x9000,
            rip: 0x4444,
            ..Default::default()
        };
        mem.write_context(0x8000, &ctx);
        let mut cursor = NativeCursor::new(mem, Arc::default(), 0x1111, 0x6f00, 0x7000);
        cursor.step().unwrap();
        cursor.reanchor(0x8000).unwrap();
        assert_eq!(cursor.ip(), 0x4444);
        assert_eq!(cursor.bp(), 0x9000);
        assert_eq!(cursor.sp(), 0x8038);
        assert_eq!(cursor.register(X86_64::R12), Ok(0xC12));
        assert_eq!(cursor.register(X86_64::RBX), Ok(0xB));
    }
}
