//! Error taxonomy for the unwinding engine.
//!
//! Every variant here is a contract violation between the code generator and
//! the runtime, never a language-level exception. Internal layers return
//! `Result<T, UnwindError>` so each failure path can be exercised in tests;
//! the outermost runtime entry points hand any error to [`fatal`], which
//! dumps diagnostics and aborts the process.

use std::fmt::Write as _;

use crate::region::RegionTable;
use crate::session::UnwindSession;

// =============================================================================
// UnwindError
// =============================================================================

/// A fatal condition detected while decoding metadata, walking, or unwinding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnwindError {
    // =========================================================================
    // Stack map decoding
    // =========================================================================
    /// The blob ended before a declared section or record was complete.
    #[error("stack map truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// The header word is not a supported stack map version.
    #[error("bad stack map header {0:#x}")]
    BadHeader(u32),

    /// Bytes remained after the last declared record.
    #[error("{0} trailing bytes after the last stack map record")]
    TrailingBytes(usize),

    /// A location tuple carried an unknown type tag.
    #[error("unknown value location type {0}")]
    UnknownLocationType(u8),

    /// A location referenced a DWARF register outside the register file.
    #[error("DWARF register {0} is outside the register file")]
    BadRegisterNumber(u16),

    /// A constant-pool location indexed past the end of the pool.
    #[error("constant pool index {index} out of range (pool has {len} entries)")]
    ConstantOutOfRange { index: usize, len: usize },

    // =========================================================================
    // LSDA decoding
    // =========================================================================
    /// An encoding byte other than omit/uleb128/udata4 where one is required.
    #[error("unsupported {field} encoding {encoding:#04x}")]
    UnsupportedEncoding { field: &'static str, encoding: u8 },

    /// A call-site entry straddled the start of the action table.
    #[error("call-site table overran the action table")]
    CallSiteTableOverrun,

    /// An action chain carried a negative (exception specification) filter.
    #[error("negative type filter {0} is not supported")]
    NegativeTypeFilter(i64),

    /// An action chain ended without any cleanup or catch entry.
    #[error("action chain exhausted without a cleanup or catch entry")]
    EmptyActionChain,

    /// An action offset pointed outside the action table.
    #[error("action offset {0} is outside the action table")]
    ActionOutOfRange(i64),

    /// A low-level DWARF read failed (usually an LEB128 running off the end).
    #[error("DWARF read failed: {0}")]
    Dwarf(#[from] gimli::Error),

    // =========================================================================
    // Unwinding
    // =========================================================================
    /// A throwing instruction has no call-site entry.
    #[error("no call-site entry covers pc {pc:#x}")]
    NoCallSiteEntry { pc: u64 },

    /// A landing pad resolved outside the owning function's code.
    #[error("landing pad {landing_pad:#x} outside code region [{start:#x}, {end:#x})")]
    LandingPadOutOfRange { landing_pad: u64, start: u64, end: u64 },

    /// An exception was thrown while cleanup code was running.
    #[error("exception raised while another unwind episode is in progress")]
    NestedUnwind,

    /// Unwinding was resumed from cleanup with no episode in flight.
    #[error("unwind resumed from cleanup without an active session")]
    NoActiveSession,

    /// The stack was exhausted without a catching frame.
    #[error("no handler found: stack exhausted after {frames} frames")]
    NoHandler { frames: usize },

    /// A walk exceeded the configured frame budget.
    #[error("stack walk exceeded {0} frames")]
    WalkTooDeep(usize),

    /// The stepping primitive could not report a register.
    #[error("register {0} unavailable in this frame")]
    RegisterUnavailable(u16),

    /// The stepping primitive failed to advance.
    #[error("stack step failed at ip {ip:#x}: {reason}")]
    StepFailed { ip: u64, reason: &'static str },

    /// A CFI row used a rule the stepper does not evaluate.
    #[error("unsupported CFI {rule} at pc {pc:#x}")]
    UnsupportedCfi { pc: u64, rule: &'static str },

    /// Landing would enter a frame with a callee-saved register unknown.
    #[error("cannot resume at {ip:#x}: callee-saved register {reg} was not recovered")]
    IncompleteRegisterState { ip: u64, reg: u16 },

    /// A generator trampoline frame had no stored return context.
    #[error("no generator return context for frame base {bp:#x}")]
    MissingReturnContext { bp: u64 },

    // =========================================================================
    // Deopt state
    // =========================================================================
    /// The frame's instruction pointer does not fall in any compiled region.
    #[error("pc {pc:#x} is not inside a compiled region")]
    NotCompiled { pc: u64 },

    /// The compiled version has no record for the frame's call site.
    #[error("no stack map record at code offset {offset:#x}")]
    NoStackMapRecord { offset: u32 },

    /// A frame layout referenced a location index the record does not have.
    #[error("layout slot {slot} references location {index}, record has {len}")]
    LayoutMismatch { slot: String, index: usize, len: usize },

    /// A memory read through a resolved location was rejected.
    #[error("invalid memory read at {0:#x}")]
    InvalidMemoryRead(u64),

    // =========================================================================
    // Region table
    // =========================================================================
    /// A new region overlapped one already registered.
    #[error("code region [{start:#x}, {end:#x}) overlaps an existing region")]
    RegionOverlap { start: u64, end: u64 },

    /// The operation needs machine support this build does not have.
    #[error("operation unsupported on this target")]
    UnsupportedTarget,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, UnwindError>;

// =============================================================================
// Fatal Path
// =============================================================================

/// Terminate the process after dumping unwinder diagnostics.
///
/// A failure at this layer means stack integrity can no longer be trusted,
/// so there is no recovery path.
#[cold]
#[inline(never)]
pub fn fatal(error: &UnwindError, session: Option<&UnwindSession>, regions: Option<&RegionTable>) -> ! {
    log::error!("{}", fatal_report(error, session, regions));
    std::process::abort()
}

/// Render the diagnostic dump emitted by [`fatal`].
pub fn fatal_report(
    error: &UnwindError,
    session: Option<&UnwindSession>,
    regions: Option<&RegionTable>,
) -> String {
    let mut out = String::with_capacity(256);
    let _ = writeln!(out, "fatal unwinder error: {error}");
    if let Some(session) = session {
        let _ = writeln!(
            out,
            "  session: active={} reraise={} pending_frame={} traceback_entries={}",
            session.is_active(),
            session.is_reraise(),
            session.has_pending_frame(),
            session.traceback().len(),
        );
    }
    if let Some(regions) = regions {
        let snapshot = regions.snapshot();
        let _ = writeln!(out, "  code regions: {}", snapshot.len());
        for region in snapshot.iter() {
            let _ = writeln!(
                out,
                "    [{:#x}, {:#x}) {:?} fn={}",
                region.start(),
                region.end(),
                region.tier(),
                region.function_id()
            );
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
