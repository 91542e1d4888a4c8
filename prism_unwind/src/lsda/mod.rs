//! Language-specific data area (LSDA) decoding.
//!
//! Each compiled version that contains cleanup or catch code carries an LSDA
//! next to its machine code. The unwind driver consults it once per frame to
//! decide whether the frame's current call site needs a landing pad.
//!
//! ```text
//! ┌───────────────────────┐
//! │ lpstart encoding (u8) │  must be omit: landing pads are function-relative
//! ├───────────────────────┤
//! │ ttype encoding (u8)   │  any value; the type table is never read
//! │ [ttype offset uleb]   │  present unless the encoding is omit
//! ├───────────────────────┤
//! │ call-site enc (u8)    │  uleb128 or udata4
//! │ call-site len (uleb)  │
//! ├───────────────────────┤
//! │ call-site table       │  sorted by start offset
//! ├───────────────────────┤
//! │ action table          │  (filter sleb, next sleb) pairs
//! └───────────────────────┘
//! ```
//!
//! There is a single exception representation, so any positive type filter
//! is treated as catch-all.

pub mod action;
pub mod call_site;
pub mod encode;

use std::sync::OnceLock;

use gimli::{EndianSlice, LittleEndian, Reader};

pub use action::{ActionChain, ActionRecord, next_action};
pub use call_site::{CallSiteCursor, CallSiteEntry, DW_EH_PE_UDATA4, DW_EH_PE_ULEB128};
pub use encode::LsdaBuilder;

use crate::error::{Result, UnwindError};

/// Encoding byte meaning "field omitted".
pub const DW_EH_PE_OMIT: u8 = gimli::DW_EH_PE_omit.0;

/// Selector value passed to a landing pad entered for cleanup only.
pub const CLEANUP_SELECTOR: i64 = 0;

// =============================================================================
// Action
// =============================================================================

/// What a frame's call site wants done with the in-flight exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Run cleanup code, then keep unwinding.
    Cleanup,
    /// Stop unwinding here; the landing pad switches on this selector.
    Catch(i64),
}

impl Action {
    /// Selector value to install in the landing-pad selector register.
    #[inline]
    pub const fn selector(self) -> i64 {
        match self {
            Self::Cleanup => CLEANUP_SELECTOR,
            Self::Catch(v) => v,
        }
    }
}

// =============================================================================
// LsdaInfo
// =============================================================================

/// A parsed LSDA header with borrowed views of its two tables.
#[derive(Debug, Clone, Copy)]
pub struct LsdaInfo<'a> {
    /// Base address landing pads and call-site starts are relative to.
    pub function_start: u64,
    /// Declared type-table encoding (recorded, never dereferenced).
    pub type_table_encoding: u8,
    /// Offset to the type table end, when present.
    pub type_table_offset: Option<u64>,
    /// Encoding of the call-site table fields.
    pub call_site_encoding: u8,
    /// Raw call-site table bytes.
    pub call_site_table: &'a [u8],
    /// Raw action table bytes (everything after the call-site table).
    pub action_table: &'a [u8],
}

/// Parse the LSDA header.
pub fn parse_header(bytes: &[u8], function_start: u64) -> Result<LsdaInfo<'_>> {
    let base = EndianSlice::new(bytes, LittleEndian);
    let mut r = base;

    let lpstart = r.read_u8()?;
    if lpstart != DW_EH_PE_OMIT {
        return Err(UnwindError::UnsupportedEncoding {
            field: "landing pad base",
            encoding: lpstart,
        });
    }

    let type_table_encoding = r.read_u8()?;
    let type_table_offset = if type_table_encoding == DW_EH_PE_OMIT {
        None
    } else {
        Some(r.read_uleb128()?)
    };

    let call_site_encoding = r.read_u8()?;
    if call_site_encoding != DW_EH_PE_ULEB128 && call_site_encoding != DW_EH_PE_UDATA4 {
        return Err(UnwindError::UnsupportedEncoding {
            field: "call-site table",
            encoding: call_site_encoding,
        });
    }
    let table_len = r.read_uleb128()?;

    let table_start = r.offset_from(base);
    let table_end = usize::try_from(table_len)
        .ok()
        .and_then(|len| table_start.checked_add(len))
        .filter(|&end| end <= bytes.len())
        .ok_or(UnwindError::CallSiteTableOverrun)?;

    Ok(LsdaInfo {
        function_start,
        type_table_encoding,
        type_table_offset,
        call_site_encoding,
        call_site_table: &bytes[table_start..table_end],
        action_table: &bytes[table_end..],
    })
}

impl<'a> LsdaInfo<'a> {
    /// Iterate the call-site table from its first entry.
    pub fn call_sites(&self) -> Result<CallSiteCursor<'a>> {
        CallSiteCursor::new(
            self.call_site_table,
            self.call_site_encoding,
            self.function_start,
        )
    }

    /// Find the entry covering `pc`.
    pub fn find_call_site_entry(&self, pc: u64) -> Result<Option<CallSiteEntry>> {
        find_call_site_entry(self.call_sites()?, pc)
    }

    /// Classify the action for a call-site entry.
    pub fn determine_action(&self, entry: &CallSiteEntry) -> Result<Action> {
        determine_action(self.action_table, entry)
    }
}

/// Find the entry covering `pc` in a table sorted by start.
///
/// The scan stops at the first entry that begins past `pc`.
pub fn find_call_site_entry<I>(entries: I, pc: u64) -> Result<Option<CallSiteEntry>>
where
    I: IntoIterator<Item = Result<CallSiteEntry>>,
{
    for entry in entries {
        let entry = entry?;
        if entry.contains(pc) {
            return Ok(Some(entry));
        }
        if pc < entry.lo {
            return Ok(None);
        }
    }
    Ok(None)
}

/// Walk an entry's action chain and decide between cleanup and catch.
pub fn determine_action(action_table: &[u8], entry: &CallSiteEntry) -> Result<Action> {
    let Some(first) = entry.action else {
        return Ok(Action::Cleanup);
    };

    let mut saw_cleanup = false;
    for record in ActionChain::new(action_table, first) {
        let record = record?;
        match record.type_filter {
            0 => saw_cleanup = true,
            f if f > 0 => return Ok(Action::Catch(f)),
            f => return Err(UnwindError::NegativeTypeFilter(f)),
        }
    }

    if saw_cleanup {
        Ok(Action::Cleanup)
    } else {
        Err(UnwindError::EmptyActionChain)
    }
}

// =============================================================================
// Lsda
// =============================================================================

/// Owned LSDA bytes for one compiled version, with the call-site table
/// decoded on first use.
#[derive(Debug)]
pub struct Lsda {
    bytes: Box<[u8]>,
    function_start: u64,
    call_sites: OnceLock<Result<Box<[CallSiteEntry]>>>,
}

impl Lsda {
    /// Wrap raw LSDA bytes for a function starting at `function_start`.
    pub fn new(bytes: impl Into<Box<[u8]>>, function_start: u64) -> Self {
        Self {
            bytes: bytes.into(),
            function_start,
            call_sites: OnceLock::new(),
        }
    }

    /// Raw bytes.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Base address for landing pads.
    #[inline]
    pub fn function_start(&self) -> u64 {
        self.function_start
    }

    /// Parse the header.
    #[inline]
    pub fn info(&self) -> Result<LsdaInfo<'_>> {
        parse_header(&self.bytes, self.function_start)
    }

    /// Decoded call-site entries, parsed once and cached.
    pub fn call_sites(&self) -> Result<&[CallSiteEntry]> {
        self.call_sites
            .get_or_init(|| {
                self.info()?
                    .call_sites()?
                    .collect::<Result<Vec<_>>>()
                    .map(Vec::into_boxed_slice)
            })
            .as_deref()
            .map_err(Clone::clone)
    }

    /// Find the entry covering `pc` in the cached table.
    pub fn find_call_site_entry(&self, pc: u64) -> Result<Option<CallSiteEntry>> {
        find_call_site_entry(self.call_sites()?.iter().copied().map(Ok), pc)
    }

    /// Classify the action for a call-site entry.
    pub fn determine_action(&self, entry: &CallSiteEntry) -> Result<Action> {
        determine_action(self.info()?.action_table, entry)
    }

    /// Check every landing pad lands inside `[code_start, code_end)`.
    pub fn validate(&self, code_start: u64, code_end: u64) -> Result<()> {
        for entry in self.call_sites()? {
            if let Some(landing_pad) = entry.landing_pad {
                if landing_pad < code_start || landing_pad >= code_end {
                    return Err(UnwindError::LandingPadOutOfRange {
                        landing_pad,
                        start: code_start,
                        end: code_end,
                    });
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
