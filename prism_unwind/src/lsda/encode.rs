//! LSDA emission.
//!
//! Produces the subset of the format the decoder accepts: function-relative
//! landing pads, no type table, and one of the two supported call-site
//! encodings.

use gimli::leb128;

use super::DW_EH_PE_OMIT;
use super::call_site::DW_EH_PE_UDATA4;

#[derive(Debug, Clone, Copy)]
struct RawCallSite {
    start: u64,
    len: u64,
    landing_pad: u64,
    action_plus_one: u64,
}

/// Incremental LSDA builder.
#[derive(Debug, Clone)]
pub struct LsdaBuilder {
    encoding: u8,
    call_sites: Vec<RawCallSite>,
    actions: Vec<u8>,
}

impl LsdaBuilder {
    /// Create a builder using `encoding` for call-site fields.
    pub fn new(encoding: u8) -> Self {
        Self {
            encoding,
            call_sites: Vec::new(),
            actions: Vec::new(),
        }
    }

    /// Append an action chain and return the offset of its first record.
    ///
    /// Records are laid out back to back, so every link is `+1` (the size
    /// of the one-byte link field itself).
    pub fn action_chain(&mut self, filters: &[i64]) -> u64 {
        let first = self.actions.len() as u64;
        for (i, &filter) in filters.iter().enumerate() {
            put_sleb(&mut self.actions, filter);
            let link = if i + 1 == filters.len() { 0 } else { 1 };
            put_sleb(&mut self.actions, link);
        }
        first
    }

    /// Append a call-site entry. Offsets are relative to the function start.
    ///
    /// Entries must be added in ascending `start` order.
    pub fn call_site(
        &mut self,
        start: u64,
        len: u64,
        landing_pad: Option<u64>,
        action: Option<u64>,
    ) -> &mut Self {
        self.call_sites.push(RawCallSite {
            start,
            len,
            landing_pad: landing_pad.unwrap_or(0),
            action_plus_one: action.map_or(0, |a| a + 1),
        });
        self
    }

    /// Produce the encoded LSDA.
    pub fn finish(&self) -> Vec<u8> {
        let mut table = Vec::new();
        for site in &self.call_sites {
            if self.encoding == DW_EH_PE_UDATA4 {
                table.extend_from_slice(&(site.start as u32).to_le_bytes());
                table.extend_from_slice(&(site.len as u32).to_le_bytes());
                table.extend_from_slice(&(site.landing_pad as u32).to_le_bytes());
            } else {
                put_uleb(&mut table, site.start);
                put_uleb(&mut table, site.len);
                put_uleb(&mut table, site.landing_pad);
            }
            put_uleb(&mut table, site.action_plus_one);
        }

        let mut out = Vec::with_capacity(table.len() + self.actions.len() + 8);
        out.push(DW_EH_PE_OMIT);
        out.push(DW_EH_PE_OMIT);
        out.push(self.encoding);
        put_uleb(&mut out, table.len() as u64);
        out.extend_from_slice(&table);
        out.extend_from_slice(&self.actions);
        out
    }
}

// Writes into a Vec cannot fail.
fn put_uleb(out: &mut Vec<u8>, value: u64) {
    let _ = leb128::write::unsigned(out, value);
}

fn put_sleb(out: &mut Vec<u8>, value: i64) {
    let _ = leb128::write::signed(out, value);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsda::{DW_EH_PE_ULEB128, parse_header};

    #[test]
    fn test_empty_lsda_layout() {
        let bytes = LsdaBuilder::new(DW_EH_PE_ULEB128).finish();
        assert_eq!(bytes, vec![0xFF, 0xFF, 0x01, 0x00]);
    }

    #[test]
    fn test_chain_bytes() {
        let mut b = LsdaBuilder::new(DW_EH_PE_ULEB128);
        assert_eq!(b.action_chain(&[0, 3]), 0);
        assert_eq!(b.action_chain(&[-1]), 4);
        assert_eq!(b.actions, vec![0x00, 0x01, 0x03, 0x00, 0x7f, 0x00]);
    }

    #[test]
    fn test_large_offsets_use_multibyte_uleb() {
        let mut b = LsdaBuilder::new(DW_EH_PE_ULEB128);
        b.call_site(0x1234, 0x200, Some(0x4000), None);
        let bytes = b.finish();
        let info = parse_header(&bytes, 0).unwrap();
        let entry = info.find_call_site_entry(0x1300).unwrap().unwrap();
        assert_eq!(entry.landing_pad, Some(0x4000));
    }
}
