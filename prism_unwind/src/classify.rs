//! Instruction pointer to execution tier classification.
//!
//! ```text
//! classify(pc)
//!   ├─ region table (binary search) ──► Compiled(region)
//!   ├─ interpreter dispatch range   ──► Interpreted
//!   ├─ generator entry trampoline   ──► GeneratorEntry
//!   ├─ deopt trampoline             ──► DeoptTrampoline
//!   └─ anything else                ──► Foreign
//! ```
//!
//! Compiled code is checked first because almost every frame on a hot
//! stack is JIT output. The fixed ranges are supplied once at startup.

use std::fmt;
use std::sync::Arc;

use crate::lsda::Lsda;
use crate::region::{CodeRegion, RegionSnapshot, RegionTable, lookup_in};

// =============================================================================
// AddressRange
// =============================================================================

/// Half-open code address range. The default range is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    #[inline]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    #[inline]
    pub const fn contains(&self, pc: u64) -> bool {
        self.start <= pc && pc < self.end
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    #[inline]
    fn overlaps(&self, other: &AddressRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }
}

// =============================================================================
// FrameKind
// =============================================================================

/// Which part of the system owns a native frame.
#[derive(Clone)]
pub enum FrameKind {
    /// JIT output of the given version.
    Compiled(Arc<CodeRegion>),
    /// The interpreter's dispatch function.
    Interpreted,
    /// The generator entry trampoline.
    GeneratorEntry,
    /// The deoptimization trampoline.
    DeoptTrampoline,
    /// Anything else: runtime, libc, embedder code.
    Foreign,
}

impl FrameKind {
    /// Whether the frame belongs to a Python function.
    #[inline]
    pub fn is_python(&self) -> bool {
        matches!(self, Self::Compiled(_) | Self::Interpreted)
    }
}

impl PartialEq for FrameKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Compiled(a), Self::Compiled(b)) => Arc::ptr_eq(a, b),
            (Self::Interpreted, Self::Interpreted)
            | (Self::GeneratorEntry, Self::GeneratorEntry)
            | (Self::DeoptTrampoline, Self::DeoptTrampoline)
            | (Self::Foreign, Self::Foreign) => true,
            _ => false,
        }
    }
}

impl Eq for FrameKind {}

impl fmt::Debug for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compiled(region) => write!(
                f,
                "Compiled(fn={}, {:#x})",
                region.function_id(),
                region.start()
            ),
            Self::Interpreted => f.write_str("Interpreted"),
            Self::GeneratorEntry => f.write_str("GeneratorEntry"),
            Self::DeoptTrampoline => f.write_str("DeoptTrampoline"),
            Self::Foreign => f.write_str("Foreign"),
        }
    }
}

// =============================================================================
// FrameClassifier
// =============================================================================

/// Maps instruction pointers to frame kinds.
#[derive(Debug, Clone)]
pub struct FrameClassifier {
    regions: Arc<RegionTable>,
    interpreter: AddressRange,
    generator_entry: AddressRange,
    deopt_trampoline: AddressRange,
    /// Exception metadata of the interpreter dispatch function.
    interpreter_lsda: Option<Arc<Lsda>>,
}

impl FrameClassifier {
    /// Create a classifier over `regions` with no fixed ranges.
    pub fn new(regions: Arc<RegionTable>) -> Self {
        Self {
            regions,
            interpreter: AddressRange::default(),
            generator_entry: AddressRange::default(),
            deopt_trampoline: AddressRange::default(),
            interpreter_lsda: None,
        }
    }

    /// Set the interpreter dispatch function's code range.
    pub fn with_interpreter(mut self, range: AddressRange) -> Self {
        self.interpreter = range;
        self.check_disjoint();
        self
    }

    /// Set the generator entry trampoline's code range.
    pub fn with_generator_entry(mut self, range: AddressRange) -> Self {
        self.generator_entry = range;
        self.check_disjoint();
        self
    }

    /// Set the deoptimization trampoline's code range.
    pub fn with_deopt_trampoline(mut self, range: AddressRange) -> Self {
        self.deopt_trampoline = range;
        self.check_disjoint();
        self
    }

    /// Attach the interpreter's own LSDA, consulted for interpreted frames.
    pub fn with_interpreter_lsda(mut self, bytes: impl Into<Box<[u8]>>) -> Self {
        self.interpreter_lsda = Some(Arc::new(Lsda::new(bytes, self.interpreter.start)));
        self
    }

    fn check_disjoint(&self) {
        debug_assert!(
            !self.interpreter.overlaps(&self.generator_entry)
                && !self.interpreter.overlaps(&self.deopt_trampoline)
                && !self.generator_entry.overlaps(&self.deopt_trampoline),
            "fixed code ranges must be disjoint"
        );
    }

    /// Classify a code address.
    #[inline]
    pub fn classify(&self, pc: u64) -> FrameKind {
        self.pin().classify(pc)
    }

    /// Pin the current set of regions for a whole walk.
    ///
    /// Every later lookup through the returned view is a lock-free binary
    /// search, and all of them see the same regions.
    #[inline]
    pub fn pin(&self) -> PinnedClassifier<'_> {
        PinnedClassifier {
            classifier: self,
            regions: self.regions.snapshot(),
        }
    }

    fn classify_fixed(&self, pc: u64) -> FrameKind {
        if self.interpreter.contains(pc) {
            FrameKind::Interpreted
        } else if self.generator_entry.contains(pc) {
            FrameKind::GeneratorEntry
        } else if self.deopt_trampoline.contains(pc) {
            FrameKind::DeoptTrampoline
        } else {
            FrameKind::Foreign
        }
    }

    /// The region table this classifier searches.
    #[inline]
    pub fn regions(&self) -> &Arc<RegionTable> {
        &self.regions
    }

    /// Interpreter dispatch range.
    #[inline]
    pub fn interpreter(&self) -> AddressRange {
        self.interpreter
    }

    /// Interpreter LSDA, if registered.
    #[inline]
    pub fn interpreter_lsda(&self) -> Option<&Arc<Lsda>> {
        self.interpreter_lsda.as_ref()
    }
}

// =============================================================================
// PinnedClassifier
// =============================================================================

/// A [`FrameClassifier`] bound to one snapshot of the region table.
pub struct PinnedClassifier<'a> {
    classifier: &'a FrameClassifier,
    regions: RegionSnapshot,
}

impl PinnedClassifier<'_> {
    /// Classify a code address against the pinned regions.
    #[inline]
    pub fn classify(&self, pc: u64) -> FrameKind {
        match lookup_in(&self.regions, pc) {
            Some(region) => FrameKind::Compiled(Arc::clone(region)),
            None => self.classifier.classify_fixed(pc),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
