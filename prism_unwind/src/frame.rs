//! Tier-independent view of one Python frame on the native stack.

use std::fmt;
use std::sync::Arc;

use crate::region::CodeRegion;
use crate::registers::RegisterFile;

// =============================================================================
// PythonFrame
// =============================================================================

/// A frame owned by the interpreter or by compiled code.
///
/// Built fresh on every step and never kept past the walk that produced it.
#[derive(Clone)]
pub enum PythonFrame {
    /// Frame running JIT output.
    Compiled {
        region: Arc<CodeRegion>,
        /// Return address into the region.
        ip: u64,
        bp: u64,
        sp: u64,
        /// Registers the stepping primitive could recover.
        regs: RegisterFile,
    },
    /// Frame of the interpreter dispatch loop.
    Interpreted { ip: u64, bp: u64 },
}

/// Kind tag used in [`FrameId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameTier {
    Compiled,
    Interpreted,
}

/// Identity of a frame within one walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId {
    pub tier: FrameTier,
    pub ip: u64,
    pub bp: u64,
}

impl PythonFrame {
    /// Instruction pointer (return address for non-leaf frames).
    #[inline]
    pub fn ip(&self) -> u64 {
        match self {
            Self::Compiled { ip, .. } | Self::Interpreted { ip, .. } => *ip,
        }
    }

    /// Frame base pointer.
    #[inline]
    pub fn bp(&self) -> u64 {
        match self {
            Self::Compiled { bp, .. } | Self::Interpreted { bp, .. } => *bp,
        }
    }

    /// Owning code region for compiled frames.
    #[inline]
    pub fn region(&self) -> Option<&Arc<CodeRegion>> {
        match self {
            Self::Compiled { region, .. } => Some(region),
            Self::Interpreted { .. } => None,
        }
    }

    /// Captured registers for compiled frames.
    #[inline]
    pub fn registers(&self) -> Option<&RegisterFile> {
        match self {
            Self::Compiled { regs, .. } => Some(regs),
            Self::Interpreted { .. } => None,
        }
    }

    #[inline]
    pub fn is_compiled(&self) -> bool {
        matches!(self, Self::Compiled { .. })
    }

    /// Whether this is a compiled frame of an OSR-entered version.
    #[inline]
    pub fn is_osr(&self) -> bool {
        self.region().is_some_and(|r| r.is_osr())
    }

    /// `(tier, ip, bp)` identity.
    pub fn id(&self) -> FrameId {
        let tier = if self.is_compiled() {
            FrameTier::Compiled
        } else {
            FrameTier::Interpreted
        };
        FrameId {
            tier,
            ip: self.ip(),
            bp: self.bp(),
        }
    }
}

impl PartialEq for PythonFrame {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for PythonFrame {}

impl fmt::Debug for PythonFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compiled {
                region, ip, bp, sp, ..
            } => f
                .debug_struct("Compiled")
                .field("function_id", &region.function_id())
                .field("ip", &format_args!("{ip:#x}"))
                .field("bp", &format_args!("{bp:#x}"))
                .field("sp", &format_args!("{sp:#x}"))
                .finish(),
            Self::Interpreted { ip, bp } => f
                .debug_struct("Interpreted")
                .field("ip", &format_args!("{ip:#x}"))
                .field("bp", &format_args!("{bp:#x}"))
                .finish(),
        }
    }
}

// =============================================================================
// FrameInfo / Statement
// =============================================================================

/// Function metadata the object model keeps for a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub function_id: u64,
    pub name: Arc<str>,
    pub filename: Arc<str>,
}

impl FrameInfo {
    pub fn new(function_id: u64, name: impl Into<Arc<str>>, filename: impl Into<Arc<str>>) -> Self {
        Self {
            function_id,
            name: name.into(),
            filename: filename.into(),
        }
    }
}

/// The logical statement a frame is currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Statement {
    /// Statement id, unique within the function.
    pub id: u32,
    /// Source line.
    pub line: u32,
}

// =============================================================================
// Tests
// =============================================================================
