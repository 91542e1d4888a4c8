//! Deoptimization state recovery.
//!
//! Rebuilds the interpreter-visible state of a compiled frame from the
//! stack map record at its current call site. The result feeds both the
//! deopt trampoline (falling back to the interpreter mid-function) and
//! introspection (`locals()`, `sys._current_frames`).
//!
//! Each compiled version carries a [`FrameLayout`] per stack map record
//! naming the record's locations:
//!
//! ```text
//! record #17 locations: [ rbx , [rbp-16] , const 0 , [rbp-24] ]
//!                          │       │          │          │
//! layout #17:             "x"     "y"     defined(y)    "!tmp"
//! ```
//!
//! A slot with a defined-flag location is only read when the flag is
//! non-zero, so uninitialized stack slots are never dereferenced. Names
//! starting with `!` are compiler temporaries and are never materialized.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::{Result, UnwindError};
use crate::frame::{FrameInfo, PythonFrame, Statement};
use crate::hooks::RuntimeHooks;
use crate::memory::FrameMemory;
use crate::region::CodeRegion;

/// Prefix marking compiler-internal slot names.
pub const INTERNAL_PREFIX: char = '!';

// =============================================================================
// FrameLayout
// =============================================================================

/// A named value at one call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedSlot {
    pub name: Arc<str>,
    /// Index of the value's location in the record.
    pub location: usize,
    /// Index of a boolean location telling whether the value is bound.
    pub defined_flag: Option<usize>,
}

impl NamedSlot {
    #[inline]
    pub fn is_internal(&self) -> bool {
        self.name.starts_with(INTERNAL_PREFIX)
    }
}

/// Names for the locations of one stack map record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameLayout {
    slots: SmallVec<[NamedSlot; 8]>,
}

impl FrameLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an always-bound slot.
    pub fn with_slot(mut self, name: &str, location: usize) -> Self {
        self.slots.push(NamedSlot {
            name: name.into(),
            location,
            defined_flag: None,
        });
        self
    }

    /// Add a slot that may be unbound, guarded by `defined_flag`.
    pub fn with_optional_slot(mut self, name: &str, location: usize, defined_flag: usize) -> Self {
        self.slots.push(NamedSlot {
            name: name.into(),
            location,
            defined_flag: Some(defined_flag),
        });
        self
    }

    #[inline]
    pub fn slots(&self) -> &[NamedSlot] {
        &self.slots
    }
}

// =============================================================================
// DeoptState
// =============================================================================

/// Materialized interpreter state for one compiled frame.
#[derive(Debug, Clone)]
pub struct DeoptState {
    /// Bound locals in layout order.
    pub locals: Vec<(Arc<str>, u64)>,
    /// Function metadata for the frame.
    pub frame_info: Option<FrameInfo>,
    /// Version the frame was executing.
    pub region: Arc<CodeRegion>,
    /// Statement the frame was executing.
    pub statement: Option<Statement>,
    /// Stack map record the state was read from.
    pub record_id: u64,
}

impl DeoptState {
    /// Look up a local by name.
    pub fn local(&self, name: &str) -> Option<u64> {
        self.locals
            .iter()
            .find(|(n, _)| &**n == name)
            .map(|&(_, v)| v)
    }
}

/// Build the deopt state of a compiled frame.
pub fn build_deopt_state<H, M>(frame: &PythonFrame, hooks: &H, memory: &M) -> Result<DeoptState>
where
    H: RuntimeHooks + ?Sized,
    M: FrameMemory,
{
    let PythonFrame::Compiled {
        region, ip, regs, ..
    } = frame
    else {
        return Err(UnwindError::NotCompiled { pc: frame.ip() });
    };

    let offset = region
        .offset_of(*ip)
        .ok_or(UnwindError::NotCompiled { pc: *ip })?;
    let record = region
        .stack_map()
        .and_then(|map| map.record_at_offset(offset))
        .ok_or(UnwindError::NoStackMapRecord { offset })?;

    let constants = region.constants();
    let resolve = |slot: &NamedSlot, index: usize| {
        let location = record
            .locations
            .get(index)
            .ok_or_else(|| UnwindError::LayoutMismatch {
                slot: slot.name.to_string(),
                index,
                len: record.locations.len(),
            })?;
        location.resolve(regs, constants, memory)
    };

    let mut locals = Vec::new();
    match region.layout(record.id) {
        Some(layout) => {
            for slot in layout.slots().iter().filter(|s| !s.is_internal()) {
                if let Some(flag) = slot.defined_flag {
                    if resolve(slot, flag)? == 0 {
                        continue;
                    }
                }
                locals.push((Arc::clone(&slot.name), resolve(slot, slot.location)?));
            }
        }
        None => log::debug!(
            "no frame layout for record {} of function {}",
            record.id,
            region.function_id()
        ),
    }

    Ok(DeoptState {
        locals,
        frame_info: hooks.frame_info(frame),
        region: Arc::clone(region),
        statement: hooks.current_statement(frame),
        record_id: record.id,
    })
}

// =============================================================================
// Tests
// =============================================================================
