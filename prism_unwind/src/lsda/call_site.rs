//! Call-site table entries.
//!
//! Each entry maps an instruction range to an optional landing pad and an
//! optional action chain. Start and landing-pad offsets are relative to the
//! landing-pad base (the function start); the length is relative to start.

use gimli::{EndianSlice, LittleEndian, Reader};

use crate::error::{Result, UnwindError};

/// Call-site offsets encoded as ULEB128.
pub const DW_EH_PE_ULEB128: u8 = gimli::DW_EH_PE_uleb128.0;
/// Call-site offsets encoded as fixed 4-byte fields.
pub const DW_EH_PE_UDATA4: u8 = gimli::DW_EH_PE_udata4.0;

// =============================================================================
// CallSiteEntry
// =============================================================================

/// One decoded call-site entry, with absolute addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSiteEntry {
    /// First covered instruction address.
    pub lo: u64,
    /// One past the last covered instruction address.
    pub hi: u64,
    /// Landing pad address, `None` when the site needs no cleanup here.
    pub landing_pad: Option<u64>,
    /// Byte offset of the first action record in the action table.
    pub action: Option<u64>,
}

impl CallSiteEntry {
    /// Whether `pc` falls in `[lo, hi)`.
    #[inline]
    pub fn contains(&self, pc: u64) -> bool {
        self.lo <= pc && pc < self.hi
    }
}

// =============================================================================
// CallSiteCursor
// =============================================================================

/// Sequential reader over a call-site table.
#[derive(Debug, Clone)]
pub struct CallSiteCursor<'a> {
    reader: EndianSlice<'a, LittleEndian>,
    encoding: u8,
    base: u64,
}

impl<'a> CallSiteCursor<'a> {
    /// Create a cursor over exactly the call-site table bytes.
    pub fn new(table: &'a [u8], encoding: u8, landing_pad_base: u64) -> Result<Self> {
        if encoding != DW_EH_PE_ULEB128 && encoding != DW_EH_PE_UDATA4 {
            return Err(UnwindError::UnsupportedEncoding {
                field: "call-site table",
                encoding,
            });
        }
        Ok(Self {
            reader: EndianSlice::new(table, LittleEndian),
            encoding,
            base: landing_pad_base,
        })
    }

    /// Whether every entry has been consumed.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.reader.is_empty()
    }

    /// Decode the next entry, or `None` at the end of the table.
    ///
    /// An entry that runs past the end of the table means it overlapped the
    /// action table that follows it.
    pub fn next_call_site(&mut self) -> Result<Option<CallSiteEntry>> {
        if self.reader.is_empty() {
            return Ok(None);
        }
        let raw = self.read_raw().map_err(|e| match e {
            gimli::Error::UnexpectedEof(_) => UnwindError::CallSiteTableOverrun,
            other => UnwindError::Dwarf(other),
        })?;
        let (start, len, landing_pad, action_plus_one) = raw;

        let lo = self.base.wrapping_add(start);
        Ok(Some(CallSiteEntry {
            lo,
            hi: lo.wrapping_add(len),
            landing_pad: (landing_pad != 0).then(|| self.base.wrapping_add(landing_pad)),
            action: action_plus_one.checked_sub(1),
        }))
    }

    fn read_raw(&mut self) -> gimli::Result<(u64, u64, u64, u64)> {
        let r = &mut self.reader;
        let (start, len, landing_pad) = if self.encoding == DW_EH_PE_UDATA4 {
            (
                r.read_u32()? as u64,
                r.read_u32()? as u64,
                r.read_u32()? as u64,
            )
        } else {
            (r.read_uleb128()?, r.read_uleb128()?, r.read_uleb128()?)
        };
        let action_plus_one = r.read_uleb128()?;
        Ok((start, len, landing_pad, action_plus_one))
    }
}

impl Iterator for CallSiteCursor<'_> {
    type Item = Result<CallSiteEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_call_site().transpose()
    }
}

// =============================================================================
// Tests
// =============================================================================
