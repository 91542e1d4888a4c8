use prism_unwind::Lsda;
use prism_unwind::lsda::{DW_EH_PE_UDATA4, DW_EH_PE_ULEB128, LsdaBuilder};
use proptest::prelude::*;

const FUNCTION_START: u64 = 0x4000;

/// (gap before the site, site length, has landing pad)
fn sites() -> impl Strategy<Value = Vec<(u64, u64, bool)>> {
    prop::collection::vec((0u64..16, 1u64..32, any::<bool>()), 0..24)
}

fn encoding() -> impl Strategy<Value = u8> {
    prop_oneof![Just(DW_EH_PE_ULEB128), Just(DW_EH_PE_UDATA4)]
}

/// Build an LSDA and return it with the absolute `[lo, hi)` of each site.
fn build(encoding: u8, layout: &[(u64, u64, bool)]) -> (Lsda, Vec<(u64, u64)>) {
    let mut builder = LsdaBuilder::new(encoding);
    let cleanup = builder.action_chain(&[0]);
    let mut ranges = Vec::new();
    let mut offset = 0;
    for &(gap, len, has_pad) in layout {
        offset += gap;
        let pad = has_pad.then_some(0x800 + offset);
        builder.call_site(offset, len, pad, has_pad.then_some(cleanup));
        ranges.push((FUNCTION_START + offset, FUNCTION_START + offset + len));
        offset += len;
    }
    (Lsda::new(builder.finish(), FUNCTION_START), ranges)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn test_parsed_table_is_sorted(enc in encoding(), layout in sites()) {
        let (lsda, ranges) = build(enc, &layout);
        let entries = lsda.call_sites().unwrap();
        prop_assert_eq!(entries.len(), ranges.len());
        prop_assert!(entries.windows(2).all(|w| w[0].lo <= w[1].lo));
    }

    #[test]
    fn test_lookup_finds_covering_entry(enc in encoding(), layout in sites()) {
        let (lsda, ranges) = build(enc, &layout);
        for &(lo, hi) in &ranges {
            for pc in [lo, (lo + hi) / 2, hi - 1] {
                let entry = lsda.find_call_site_entry(pc).unwrap().unwrap();
                prop_assert_eq!((entry.lo, entry.hi), (lo, hi));
            }
        }
    }

    #[test]
    fn test_lookup_misses_gaps(enc in encoding(), layout in sites()) {
        let (lsda, ranges) = build(enc, &layout);
        let mut prev_hi = FUNCTION_START;
        for &(lo, hi) in &ranges {
            if lo > prev_hi {
                prop_assert_eq!(lsda.find_call_site_entry(lo - 1).unwrap(), None);
            }
            prev_hi = hi;
        }
        prop_assert_eq!(lsda.find_call_site_entry(prev_hi + 1).unwrap(), None);
    }

    #[test]
    fn test_arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let lsda = Lsda::new(bytes, FUNCTION_START);
        if let Ok(entries) = lsda.call_sites() {
            for entry in entries {
                let _ = lsda.determine_action(entry);
            }
        }
    }
}
