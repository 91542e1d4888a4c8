//! Stack stepping primitives.
//!
//! The walker and the unwind driver only ever talk to a [`StackCursor`].
//! Two implementations exist:
//!
//! - [`NativeCursor`]: steps a live stack by CFI, falling back to the RBP
//!   chain for frames without it, and can transfer control to a landing pad.
//! - [`SnapshotCursor`]: steps over frames captured earlier, for threads
//!   parked at a global pause point. Resuming records the landing state
//!   instead of jumping.
//!
//! A fresh cursor sits before the innermost frame; the first successful
//! [`StackCursor::step`] positions it on that frame.

pub mod cfi;
pub mod native;
pub mod snapshot;

use std::sync::Arc;

use gimli::Register;

pub use cfi::{CfiScratch, CfiSection, CfiTable};
pub use native::NativeCursor;
pub use snapshot::{Landing, SnapshotCursor, SnapshotFrame, SnapshotMemory};

use crate::error::{Result, UnwindError};
use crate::lsda::Lsda;
use crate::memory::FrameMemory;
use crate::registers::{REGISTER_COUNT, RegisterFile};

/// One-frame-at-a-time access to a thread's stack.
pub trait StackCursor {
    /// Move to the next (outer) frame. Returns `false` past the outermost.
    fn step(&mut self) -> Result<bool>;

    /// Instruction pointer of the current frame.
    fn ip(&self) -> u64;

    /// Stack pointer of the current frame.
    fn sp(&self) -> u64;

    /// Frame base pointer of the current frame.
    fn bp(&self) -> u64;

    /// Address the current frame is classified and looked up by.
    ///
    /// A frame suspended in a call reports its return address as the
    /// instruction pointer, and that address can already lie past the end
    /// of the calling function; the call itself sits one byte earlier.
    /// Frames stopped at an exact instruction (the innermost frame of a
    /// capture, a frame resumed at a landing pad) override this.
    fn lookup_pc(&self) -> u64 {
        self.ip().saturating_sub(1)
    }

    /// Read a register as it will be when the current frame resumes.
    ///
    /// Registers the cursor cannot recover report
    /// [`UnwindError::RegisterUnavailable`].
    fn register(&self, reg: Register) -> Result<u64>;

    /// Override a register for [`StackCursor::resume`].
    fn set_register(&mut self, reg: Register, value: u64) -> Result<()>;

    /// Override the resume address.
    fn set_ip(&mut self, ip: u64);

    /// Continue from the generator return context stored at
    /// `context_address`. The resumer frame becomes the current frame.
    fn reanchor(&mut self, context_address: u64) -> Result<()>;

    /// Exception metadata for the current frame when it is not JIT output.
    fn lsda(&self) -> Option<Arc<Lsda>> {
        None
    }

    /// Memory backing the stack being walked.
    fn memory(&self) -> &dyn FrameMemory;

    /// Every register the cursor can recover for the current frame.
    fn registers(&self) -> RegisterFile {
        let mut regs = RegisterFile::new();
        for n in 0..REGISTER_COUNT as u16 {
            match self.register(Register(n)) {
                Ok(value) => {
                    let _ = regs.set(Register(n), value);
                }
                Err(UnwindError::RegisterUnavailable(_)) => {}
                Err(e) => log::trace!("register {n} skipped: {e}"),
            }
        }
        regs
    }

    /// Transfer control to the current frame with the current registers.
    ///
    /// # Safety
    ///
    /// For cursors over a live stack this does not return: every frame
    /// between the caller and the target is discarded without running
    /// destructors, so none of them may own resources.
    unsafe fn resume(&mut self) -> Result<()>;
}
