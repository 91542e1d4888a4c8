//! Action table records.
//!
//! An action record is a pair of SLEB128 values: a type filter and the
//! self-relative offset of the next record in the chain (measured from the
//! start of the offset field itself; zero ends the chain).

use gimli::{EndianSlice, LittleEndian, Reader};

use crate::error::{Result, UnwindError};

/// One decoded action record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionRecord {
    /// Type filter: zero is cleanup, positive is a catch.
    pub type_filter: i64,
    /// Offset of the next record in the action table, if any.
    pub next: Option<u64>,
}

/// Decode the action record at `offset` within `table`.
pub fn next_action(table: &[u8], offset: u64) -> Result<ActionRecord> {
    let start = usize::try_from(offset)
        .ok()
        .filter(|&o| o < table.len())
        .ok_or(UnwindError::ActionOutOfRange(offset as i64))?;

    let base = EndianSlice::new(table, LittleEndian);
    let mut reader = EndianSlice::new(&table[start..], LittleEndian);
    let type_filter = reader.read_sleb128()?;
    let field_pos = reader.offset_from(base) as i64;
    let displacement = reader.read_sleb128()?;

    let next = if displacement == 0 {
        None
    } else {
        let target = field_pos
            .checked_add(displacement)
            .filter(|&t| t >= 0 && (t as usize) < table.len())
            .ok_or(UnwindError::ActionOutOfRange(field_pos.wrapping_add(displacement)))?;
        Some(target as u64)
    };

    Ok(ActionRecord { type_filter, next })
}

// =============================================================================
// ActionChain
// =============================================================================

/// Iterator over an action chain starting at a given record.
///
/// Stops with an error instead of looping forever on a cyclic chain.
#[derive(Debug, Clone)]
pub struct ActionChain<'a> {
    table: &'a [u8],
    next: Option<u64>,
    remaining_steps: usize,
}

impl<'a> ActionChain<'a> {
    /// Start a chain at `first` within the action table.
    pub fn new(table: &'a [u8], first: u64) -> Self {
        Self {
            table,
            next: Some(first),
            // Every record occupies at least two bytes.
            remaining_steps: table.len() / 2 + 1,
        }
    }
}

impl Iterator for ActionChain<'_> {
    type Item = Result<ActionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next.take()?;
        if self.remaining_steps == 0 {
            return Some(Err(UnwindError::ActionOutOfRange(offset as i64)));
        }
        self.remaining_steps -= 1;
        let record = next_action(self.table, offset);
        if let Ok(rec) = &record {
            self.next = rec.next;
        }
        Some(record)
    }
}

// =============================================================================
// Tests
// =============================================================================
