//! Compiler-emitted stack maps.
//!
//! A stack map describes, for every call site of a compiled version, where
//! each live value sits at the moment the call returns. The deopt state
//! builder and the unwind session's scoped-value release both resolve these
//! locations against a frame's captured registers.
//!
//! # Design
//!
//! - Records are kept in emission order and indexed twice: by call-site id
//!   (hash map) and by code offset (sorted index for O(log n) lookup).
//! - Locations are decoded into [`ValueLocation`] variants up front, so
//!   unknown tags are rejected at decode time rather than at read time.
//! - Semantic validation (addresses in bounds, registers recoverable) is
//!   deferred to resolution.

pub mod decode;
pub mod location;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

pub use decode::decode;
pub use location::{LiveOut, ValueLocation};

/// Header word for the supported stack map version (version 1, reserved 0).
pub const STACK_MAP_VERSION: u32 = 1;

// =============================================================================
// Records
// =============================================================================

/// Prologue metadata for one function covered by the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionRecord {
    /// Function entry address as emitted (may be zero before relocation).
    pub address: u64,
    /// Fixed frame size in bytes.
    pub stack_size: u64,
}

/// Value locations for one call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackMapRecord {
    /// Call-site identifier chosen by the code generator.
    pub id: u64,
    /// Offset of the call's return address from the function start.
    pub code_offset: u32,
    /// Reserved record flags.
    pub flags: u16,
    /// Ordered locations, meaningful only at this exact call site.
    pub locations: SmallVec<[ValueLocation; 8]>,
    /// Registers live across the call.
    pub live_outs: SmallVec<[LiveOut; 2]>,
}

// =============================================================================
// StackMap
// =============================================================================

/// A decoded stack map for one compiled version.
#[derive(Debug, Clone, Default)]
pub struct StackMap {
    functions: Vec<FunctionRecord>,
    constants: Vec<u64>,
    records: Vec<StackMapRecord>,
    /// Record indices sorted by code offset.
    by_offset: Box<[u32]>,
    /// Record index by call-site id.
    by_id: FxHashMap<u64, u32>,
}

impl StackMap {
    /// Assemble a map from decoded sections and build its indexes.
    pub fn from_parts(
        functions: Vec<FunctionRecord>,
        constants: Vec<u64>,
        records: Vec<StackMapRecord>,
    ) -> Self {
        let mut by_offset: Vec<u32> = (0..records.len() as u32).collect();
        by_offset.sort_by_key(|&i| records[i as usize].code_offset);

        let mut by_id = FxHashMap::default();
        by_id.reserve(records.len());
        for (i, record) in records.iter().enumerate() {
            by_id.entry(record.id).or_insert(i as u32);
        }

        Self {
            functions,
            constants,
            records,
            by_offset: by_offset.into_boxed_slice(),
            by_id,
        }
    }

    /// Function prologue records.
    #[inline]
    pub fn functions(&self) -> &[FunctionRecord] {
        &self.functions
    }

    /// Constant pool shared by all records.
    #[inline]
    pub fn constants(&self) -> &[u64] {
        &self.constants
    }

    /// Records in emission order.
    #[inline]
    pub fn records(&self) -> &[StackMapRecord] {
        &self.records
    }

    /// Look up a record by call-site id.
    #[inline]
    pub fn record_by_id(&self, id: u64) -> Option<&StackMapRecord> {
        self.by_id.get(&id).map(|&i| &self.records[i as usize])
    }

    /// Look up the record whose return address is exactly `code_offset`.
    pub fn record_at_offset(&self, code_offset: u32) -> Option<&StackMapRecord> {
        let idx = self
            .by_offset
            .binary_search_by_key(&code_offset, |&i| self.records[i as usize].code_offset)
            .ok()?;
        Some(&self.records[self.by_offset[idx] as usize])
    }
}

// =============================================================================
// StackMapEncoder
// =============================================================================

/// Serializes stack maps in the wire format [`decode`] consumes.
///
/// The code generator's test harnesses use this to produce synthetic maps.
#[derive(Debug, Default)]
pub struct StackMapEncoder {
    functions: Vec<FunctionRecord>,
    constants: Vec<u64>,
    records: Vec<u8>,
    record_count: u32,
}

impl StackMapEncoder {
    /// Create an empty encoder.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function record.
    pub fn add_function(&mut self, address: u64, stack_size: u64) {
        self.functions.push(FunctionRecord {
            address,
            stack_size,
        });
    }

    /// Add a constant and return its pool index.
    pub fn add_constant(&mut self, value: u64) -> u32 {
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    /// Append a record.
    pub fn add_record(
        &mut self,
        id: u64,
        code_offset: u32,
        locations: &[ValueLocation],
        live_outs: &[LiveOut],
    ) {
        let out = &mut self.records;
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&code_offset.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(locations.len() as u16).to_le_bytes());
        for loc in locations {
            let (kind, reg, offset) = loc.to_raw();
            out.push(kind);
            out.push(8);
            out.extend_from_slice(&reg.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
        }
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(live_outs.len() as u16).to_le_bytes());
        for live in live_outs {
            out.extend_from_slice(&live.reg.0.to_le_bytes());
            out.push(0);
            out.push(live.size);
        }
        if live_outs.len() % 2 == 0 {
            out.extend_from_slice(&0u32.to_le_bytes());
        }
        self.record_count += 1;
    }

    /// Produce the encoded blob.
    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            decode::HEADER_SIZE
                + self.functions.len() * decode::FUNCTION_RECORD_SIZE
                + self.constants.len() * 8
                + self.records.len(),
        );
        out.extend_from_slice(&STACK_MAP_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.functions.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.constants.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.record_count.to_le_bytes());
        for f in &self.functions {
            out.extend_from_slice(&f.address.to_le_bytes());
            out.extend_from_slice(&f.stack_size.to_le_bytes());
        }
        for c in &self.constants {
            out.extend_from_slice(&c.to_le_bytes());
        }
        out.extend_from_slice(&self.records);
        out
    }
}

// =============================================================================
// Tests
// =============================================================================
