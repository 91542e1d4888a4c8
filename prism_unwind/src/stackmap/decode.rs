//! Binary stack map decoding.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ header u32 │ num_functions u32 │ num_constants u32 │ num_records u32 │
//! ├──────────────────────────────────────────────────────────────┤
//! │ num_functions × { address u64, stack_size u64 }              │
//! ├──────────────────────────────────────────────────────────────┤
//! │ num_constants × u64                                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │ num_records × {                                              │
//! │   id u64, code_offset u32, flags u16, num_locations u16,     │
//! │   locations[num_locations] (8 bytes each),                   │
//! │   pad u16, num_live_outs u16,                                │
//! │   live_outs[num_live_outs] (4 bytes each),                   │
//! │   pad to 8-byte alignment                                    │
//! │ }                                                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All fields are little-endian. Decoding is all-or-nothing: any structural
//! inconsistency rejects the whole blob.

use gimli::Register;
use smallvec::SmallVec;

use super::location::{LIVE_OUT_SIZE, LOCATION_SIZE, LiveOut, ValueLocation};
use super::{FunctionRecord, STACK_MAP_VERSION, StackMap, StackMapRecord};
use crate::error::{Result, UnwindError};

/// Size of the fixed header prefix.
pub const HEADER_SIZE: usize = 16;
/// Size of one function record.
pub const FUNCTION_RECORD_SIZE: usize = 16;
/// Size of the fixed part of a record before its locations.
pub const RECORD_PREFIX_SIZE: usize = 16;

// =============================================================================
// ByteReader
// =============================================================================

/// Bounds-checked little-endian reader over the blob.
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let available = self.bytes.len() - self.pos;
        if available < N {
            return Err(UnwindError::Truncated {
                offset: self.pos,
                needed: N,
                available,
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    fn require(&self, needed: usize) -> Result<()> {
        let available = self.bytes.len() - self.pos;
        if available < needed {
            return Err(UnwindError::Truncated {
                offset: self.pos,
                needed,
                available,
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a stack map blob.
pub fn decode(bytes: &[u8]) -> Result<StackMap> {
    let mut r = ByteReader::new(bytes);

    let header = r.u32()?;
    if header != STACK_MAP_VERSION {
        return Err(UnwindError::BadHeader(header));
    }
    let num_functions = r.u32()? as usize;
    let num_constants = r.u32()? as usize;
    let num_records = r.u32()? as usize;

    // Reject absurd counts before allocating for them.
    r.require(num_functions.saturating_mul(FUNCTION_RECORD_SIZE))?;
    let mut functions = Vec::with_capacity(num_functions);
    for _ in 0..num_functions {
        functions.push(FunctionRecord {
            address: r.u64()?,
            stack_size: r.u64()?,
        });
    }

    r.require(num_constants.saturating_mul(8))?;
    let mut constants = Vec::with_capacity(num_constants);
    for _ in 0..num_constants {
        constants.push(r.u64()?);
    }

    r.require(num_records.saturating_mul(RECORD_PREFIX_SIZE))?;
    let mut records = Vec::with_capacity(num_records);
    for _ in 0..num_records {
        records.push(decode_record(&mut r)?);
    }

    if r.remaining() != 0 {
        return Err(UnwindError::TrailingBytes(r.remaining()));
    }

    Ok(StackMap::from_parts(functions, constants, records))
}

fn decode_record(r: &mut ByteReader<'_>) -> Result<StackMapRecord> {
    let id = r.u64()?;
    let code_offset = r.u32()?;
    let flags = r.u16()?;
    let num_locations = r.u16()? as usize;

    r.require(num_locations * LOCATION_SIZE)?;
    let mut locations = SmallVec::with_capacity(num_locations);
    for _ in 0..num_locations {
        let kind = r.u8()?;
        let _size = r.u8()?;
        let regnum = r.u16()?;
        let offset = r.i32()?;
        locations.push(ValueLocation::from_raw(kind, regnum, offset)?);
    }

    let _pad = r.u16()?;
    let num_live_outs = r.u16()? as usize;
    r.require(num_live_outs * LIVE_OUT_SIZE)?;
    let mut live_outs = SmallVec::with_capacity(num_live_outs);
    for _ in 0..num_live_outs {
        let regnum = r.u16()?;
        let _reserved = r.u8()?;
        let size = r.u8()?;
        live_outs.push(LiveOut {
            reg: Register(regnum),
            size,
        });
    }

    // Locations end 8-aligned; the pad/count pair plus an even number of
    // 4-byte live-outs leaves the cursor 4 bytes short of alignment.
    if num_live_outs % 2 == 0 {
        let _align = r.u32()?;
    }

    Ok(StackMapRecord {
        id,
        code_offset,
        flags,
        locations,
        live_outs,
    })
}

// =============================================================================
// Tests
// =============================================================================
