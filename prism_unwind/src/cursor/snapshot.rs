//! Stepping over a captured stack.
//!
//! A thread parked at a global pause point has its frames captured once;
//! the walker and deopt builder then run over the capture while the thread
//! stays parked. The same cursor drives the unwinder's tests.

use std::sync::Arc;

use gimli::{Register, X86_64};
use rustc_hash::FxHashMap;

use super::StackCursor;
use crate::error::{Result, UnwindError};
use crate::generator::ReturnContext;
use crate::lsda::Lsda;
use crate::memory::FrameMemory;
use crate::registers::RegisterFile;

// =============================================================================
// SnapshotMemory
// =============================================================================

/// Sparse word-addressed copy of stack memory.
#[derive(Debug, Clone, Default)]
pub struct SnapshotMemory {
    words: FxHashMap<u64, u64>,
}

impl SnapshotMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one word.
    pub fn write_word(&mut self, addr: u64, value: u64) {
        self.words.insert(addr, value);
    }

    /// Store a generator return context at `addr`.
    pub fn write_context(&mut self, addr: u64, ctx: &ReturnContext) {
        for (i, word) in ctx.to_words().into_iter().enumerate() {
            self.write_word(addr + i as u64 * 8, word);
        }
    }
}

impl FrameMemory for SnapshotMemory {
    fn read_word(&self, addr: u64) -> Result<u64> {
        self.words
            .get(&addr)
            .copied()
            .ok_or(UnwindError::InvalidMemoryRead(addr))
    }
}

// =============================================================================
// SnapshotFrame
// =============================================================================

/// One captured frame.
#[derive(Debug, Clone)]
pub struct SnapshotFrame {
    pub ip: u64,
    pub sp: u64,
    pub bp: u64,
    pub regs: RegisterFile,
    /// Metadata for frames that are not JIT output.
    pub lsda: Option<Arc<Lsda>>,
    /// `ip` is the executing instruction rather than a return address.
    pub exact_pc: bool,
}

impl SnapshotFrame {
    /// A frame with only its frame registers known.
    pub fn new(ip: u64, sp: u64, bp: u64) -> Self {
        let mut regs = RegisterFile::new();
        let _ = regs.set(X86_64::RA, ip);
        let _ = regs.set(X86_64::RSP, sp);
        let _ = regs.set(X86_64::RBP, bp);
        Self {
            ip,
            sp,
            bp,
            regs,
            lsda: None,
            exact_pc: false,
        }
    }

    /// Mark `ip` as the executing instruction, as for a frame interrupted
    /// outside any call.
    pub fn at_exact_pc(mut self) -> Self {
        self.exact_pc = true;
        self
    }

    /// Record a recovered register. Registers outside the file are ignored.
    pub fn with_register(mut self, reg: Register, value: u64) -> Self {
        let _ = self.regs.set(reg, value);
        self
    }

    /// Attach exception metadata.
    pub fn with_lsda(mut self, lsda: Arc<Lsda>) -> Self {
        self.lsda = Some(lsda);
        self
    }
}

// =============================================================================
// SnapshotCursor
// =============================================================================

/// State recorded by [`SnapshotCursor`] in place of a jump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Landing {
    pub ip: u64,
    pub sp: u64,
    pub bp: u64,
    pub regs: RegisterFile,
    /// Position of the landed frame in the capture.
    pub frame_index: usize,
}

/// Cursor over captured frames, innermost first.
#[derive(Debug, Clone)]
pub struct SnapshotCursor {
    frames: Vec<SnapshotFrame>,
    memory: SnapshotMemory,
    pos: Option<usize>,
    current: Option<SnapshotFrame>,
    landing: Option<Landing>,
}

impl SnapshotCursor {
    /// Create a cursor over `frames` (innermost first).
    pub fn new(frames: Vec<SnapshotFrame>) -> Self {
        Self::with_memory(frames, SnapshotMemory::new())
    }

    /// Create a cursor whose stack memory is also available.
    pub fn with_memory(frames: Vec<SnapshotFrame>, memory: SnapshotMemory) -> Self {
        Self {
            frames,
            memory,
            pos: None,
            current: None,
            landing: None,
        }
    }

    /// Where the last [`StackCursor::resume`] would have jumped.
    #[inline]
    pub fn landing(&self) -> Option<&Landing> {
        self.landing.as_ref()
    }

    /// The stack as seen by landing-pad code that calls back into the
    /// unwinder: the landed frame, now executing at the landing pad, and
    /// everything outside it.
    pub fn after_landing(&self) -> Option<SnapshotCursor> {
        let landing = self.landing.as_ref()?;
        let mut frames = self.frames[landing.frame_index..].to_vec();
        let top = frames.first_mut()?;
        top.ip = landing.ip;
        top.regs = landing.regs;
        top.exact_pc = true;
        Some(Self::with_memory(frames, self.memory.clone()))
    }

    fn current(&self) -> Result<&SnapshotFrame> {
        self.current.as_ref().ok_or(UnwindError::StepFailed {
            ip: 0,
            reason: "cursor is not positioned on a frame",
        })
    }
}

impl StackCursor for SnapshotCursor {
    fn step(&mut self) -> Result<bool> {
        let next = self.pos.map_or(0, |p| p + 1);
        if next >= self.frames.len() {
            self.pos = Some(self.frames.len());
            self.current = None;
            return Ok(false);
        }
        self.pos = Some(next);
        self.current = Some(self.frames[next].clone());
        Ok(true)
    }

    fn ip(&self) -> u64 {
        self.current.as_ref().map_or(0, |f| f.ip)
    }

    fn sp(&self) -> u64 {
        self.current.as_ref().map_or(0, |f| f.sp)
    }

    fn bp(&self) -> u64 {
        self.current.as_ref().map_or(0, |f| f.bp)
    }

    fn lookup_pc(&self) -> u64 {
        match &self.current {
            Some(frame) if frame.exact_pc => frame.ip,
            Some(frame) => frame.ip.saturating_sub(1),
            None => 0,
        }
    }

    fn register(&self, reg: Register) -> Result<u64> {
        self.current()?.regs.get(reg)
    }

    fn set_register(&mut self, reg: Register, value: u64) -> Result<()> {
        let frame = self.current.as_mut().ok_or(UnwindError::StepFailed {
            ip: 0,
            reason: "cursor is not positioned on a frame",
        })?;
        frame.regs.set(reg, value)?;
        match reg {
            X86_64::RSP => frame.sp = value,
            X86_64::RBP => frame.bp = value,
            X86_64::RA => frame.ip = value,
            _ => {}
        }
        Ok(())
    }

    fn set_ip(&mut self, ip: u64) {
        if let Some(frame) = self.current.as_mut() {
            frame.ip = ip;
            let _ = frame.regs.set(X86_64::RA, ip);
        }
    }

    /// Jump forward to the captured frame the context returns into.
    fn reanchor(&mut self, context_address: u64) -> Result<()> {
        let ctx = ReturnContext::read(&self.memory, context_address)?;
        let start = self.pos.map_or(0, |p| p + 1);
        let offset = self.frames[start.min(self.frames.len())..]
            .iter()
            .position(|f| f.ip == ctx.rip && f.bp == ctx.rbp)
            .ok_or(UnwindError::StepFailed {
                ip: ctx.rip,
                reason: "return context does not match a captured frame",
            })?;

        let idx = start + offset;
        let mut frame = self.frames[idx].clone();
        for (reg, value) in ctx.registers(context_address).iter() {
            let _ = frame.regs.set(reg, value);
        }
        frame.sp = ReturnContext::resumer_sp(context_address);
        self.pos = Some(idx);
        self.current = Some(frame);
        Ok(())
    }

    fn lsda(&self) -> Option<Arc<Lsda>> {
        self.current.as_ref()?.lsda.clone()
    }

    fn memory(&self) -> &dyn FrameMemory {
        &self.memory
    }

    unsafe fn resume(&mut self) -> Result<()> {
        let frame = self.current()?;
        let landing = Landing {
            ip: frame.ip,
            sp: frame.sp,
            bp: frame.bp,
            regs: frame.regs,
            frame_index: self.pos.unwrap_or(0),
        };
        self.landing = Some(landing);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn frames() -> Vec<SnapshotFrame> {
        vec![
            SnapshotFrame::new(0x1010, 0x6000, 0x6100).with_register(X86_64::RBX, 7),
            SnapshotFrame::new(0x5010, 0x6110, 0x6200),
            SnapshotFrame::new(0x9010, 0x6210, 0x6300),
        ]
    }

    #[test]
    fn test_steps_innermost_first() {
        let mut cursor = SnapshotCursor::new(frames());
        let mut ips = Vec::new();
        while cursor.step().unwrap() {
            ips.push(cursor.ip());
        }
        assert_eq!(ips, vec![0x1010, 0x5010, 0x9010]);
        assert!(!cursor.step().unwrap());
    }

    #[test]
    fn test_registers_per_frame() {
        let mut cursor = SnapshotCursor::new(frames());
        cursor.step().unwrap();
        assert_eq!(cursor.register(X86_64::RBX), Ok(7));
        cursor.step().unwrap();
        assert_eq!(
            cursor.register(X86_64::RBX),
            Err(UnwindError::RegisterUnavailable(3))
        );
    }

    #[test]
    fn test_resume_records_landing() {
        let mut cursor = SnapshotCursor::new(frames());
        cursor.step().unwrap();
        cursor.step().unwrap();
        cursor.set_register(X86_64::RAX, 0xAA).unwrap();
        cursor.set_ip(0x5080);
        unsafe { cursor.resume().unwrap() };

        let landing = cursor.landing().unwrap();
        assert_eq!(landing.ip, 0x5080);
        assert_eq!(landing.frame_index, 1);
        assert_eq!(landing.regs.get(X86_64::RAX), Ok(0xAA));

        let mut after = cursor.after_landing().unwrap();
        assert!(after.step().unwrap());
        assert_eq!(after.ip(), 0x5080);
        assert_eq!(after.lookup_pc(), 0x5080);
        assert!(after.step().unwrap());
        assert_eq!(after.ip(), 0x9010);
        assert_eq!(after.lookup_pc(), 0x900f);
    }

    #[test]
    fn test_reanchor_skips_physical_callers() {
        let mut mem = SnapshotMemory::new();
        mem.write_context(
            0x8000,
            &ReturnContext {
                rbp: 0x6300,
                rip: 0x9010,
                r13: 13,
                ..Default::default()
            },
        );
        let mut cursor = SnapshotCursor::with_memory(frames(), mem);
        cursor.step().unwrap();
        cursor.reanchor(0x8000).unwrap();
        assert_eq!(cursor.ip(), 0x9010);
        assert_eq!(cursor.sp(), 0x8038);
        assert_eq!(cursor.register(X86_64::R13), Ok(13));
        assert!(!cursor.step().unwrap());
    }

    #[test]
    fn test_reanchor_without_match_fails() {
        let mut mem = SnapshotMemory::new();
        mem.write_context(0x8000, &ReturnContext::default());
        let mut cursor = SnapshotCursor::with_memory(frames(), mem);
        cursor.step().unwrap();
        assert!(matches!(
            cursor.reanchor(0x8000),
            Err(UnwindError::StepFailed { .. })
        ));
        assert!(matches!(
            cursor.reanchor(0x9000),
            Err(UnwindError::InvalidMemoryRead(0x9000))
        ));
    }
}
