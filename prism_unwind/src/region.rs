//! Compiled code regions and the PC lookup table.
//!
//! Every compiled version of a function occupies one contiguous
//! [`CodeRegion`]. The region carries the metadata the unwinder needs for
//! frames executing inside it: the stack map, the LSDA, deopt frame layouts
//! and the scoped-value release table.
//!
//! # Concurrency
//!
//! The [`RegionTable`] is copy-on-write. Publishing or retiring a version
//! builds a new sorted vector and swaps it in under the writer lock. Readers
//! take the read lock only to clone the current `Arc`. A walk pins one
//! snapshot up front (see `FrameClassifier::pin`) and searches it without
//! any lock, so it sees one consistent set of regions from start to finish.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::deopt::FrameLayout;
use crate::error::{Result, UnwindError};
use crate::lsda::Lsda;
use crate::stackmap::{StackMap, ValueLocation};

// =============================================================================
// Tier
// =============================================================================

/// Compilation tier that produced a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Template JIT output.
    Baseline,
    /// Speculative optimizing JIT output.
    Optimized,
}

// =============================================================================
// CodeRegion
// =============================================================================

/// One compiled version of a function.
pub struct CodeRegion {
    start: u64,
    size: u64,
    tier: Tier,
    function_id: u64,
    /// Version was entered through on-stack replacement.
    is_osr: bool,
    stack_map: Option<Arc<StackMap>>,
    lsda: Option<Arc<Lsda>>,
    /// Deopt layouts keyed by stack map record id.
    layouts: FxHashMap<u64, FrameLayout>,
    /// Locations released before frame cleanup, keyed by return-address offset.
    scoped_releases: FxHashMap<u32, SmallVec<[ValueLocation; 4]>>,
}

impl CodeRegion {
    /// Create a region covering `[start, start + size)`.
    pub fn new(start: u64, size: u64, tier: Tier, function_id: u64) -> Self {
        Self {
            start,
            size,
            tier,
            function_id,
            is_osr: false,
            stack_map: None,
            lsda: None,
            layouts: FxHashMap::default(),
            scoped_releases: FxHashMap::default(),
        }
    }

    /// Attach the decoded stack map.
    pub fn with_stack_map(mut self, stack_map: StackMap) -> Self {
        self.stack_map = Some(Arc::new(stack_map));
        self
    }

    /// Attach exception-handling metadata.
    pub fn with_lsda(mut self, bytes: impl Into<Box<[u8]>>) -> Self {
        self.lsda = Some(Arc::new(Lsda::new(bytes, self.start)));
        self
    }

    /// Attach the deopt layout for one stack map record.
    pub fn with_layout(mut self, record_id: u64, layout: FrameLayout) -> Self {
        self.layouts.insert(record_id, layout);
        self
    }

    /// Mark the version as an OSR entry.
    pub fn with_osr(mut self) -> Self {
        self.is_osr = true;
        self
    }

    /// Record values to release when unwinding through the call returning to
    /// `return_offset`.
    pub fn with_scoped_release(mut self, return_offset: u32, locations: &[ValueLocation]) -> Self {
        self.scoped_releases
            .entry(return_offset)
            .or_default()
            .extend_from_slice(locations);
        self
    }

    /// First code address.
    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last code address.
    #[inline]
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    /// Code size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Producing tier.
    #[inline]
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Owning function id.
    #[inline]
    pub fn function_id(&self) -> u64 {
        self.function_id
    }

    /// Whether this version was entered by OSR.
    #[inline]
    pub fn is_osr(&self) -> bool {
        self.is_osr
    }

    /// Whether `pc` lies inside the region.
    #[inline]
    pub fn contains(&self, pc: u64) -> bool {
        self.start <= pc && pc < self.end()
    }

    /// Offset of `pc` from the region start, if inside.
    #[inline]
    pub fn offset_of(&self, pc: u64) -> Option<u32> {
        if self.contains(pc) {
            u32::try_from(pc - self.start).ok()
        } else {
            None
        }
    }

    /// Stack map for this version.
    #[inline]
    pub fn stack_map(&self) -> Option<&StackMap> {
        self.stack_map.as_deref()
    }

    /// Constant pool of this version's stack map.
    #[inline]
    pub fn constants(&self) -> &[u64] {
        self.stack_map
            .as_deref()
            .map(StackMap::constants)
            .unwrap_or(&[])
    }

    /// Exception-handling metadata.
    #[inline]
    pub fn lsda(&self) -> Option<&Arc<Lsda>> {
        self.lsda.as_ref()
    }

    /// Deopt layout for a stack map record.
    #[inline]
    pub fn layout(&self, record_id: u64) -> Option<&FrameLayout> {
        self.layouts.get(&record_id)
    }

    /// Locations to release when unwinding through `return_address`.
    pub fn scoped_releases_at(&self, return_address: u64) -> &[ValueLocation] {
        self.offset_of(return_address)
            .and_then(|off| self.scoped_releases.get(&off))
            .map(|locs| locs.as_slice())
            .unwrap_or(&[])
    }

    /// Check the LSDA parses and every landing pad lies inside the region.
    pub fn validate(&self) -> Result<()> {
        match &self.lsda {
            Some(lsda) => lsda.validate(self.start, self.end()),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for CodeRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeRegion")
            .field("range", &format_args!("{:#x}..{:#x}", self.start, self.end()))
            .field("tier", &self.tier)
            .field("function_id", &self.function_id)
            .field("is_osr", &self.is_osr)
            .field("has_stack_map", &self.stack_map.is_some())
            .field("has_lsda", &self.lsda.is_some())
            .finish()
    }
}

// =============================================================================
// RegionTable
// =============================================================================

/// One published set of regions, sorted by start.
pub type RegionSnapshot = Arc<Vec<Arc<CodeRegion>>>;

/// Sorted, non-overlapping set of live code regions.
#[derive(Debug, Default)]
pub struct RegionTable {
    regions: RwLock<RegionSnapshot>,
}

impl RegionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a newly compiled version.
    ///
    /// Fails if the region overlaps one already registered.
    pub fn register(&self, region: CodeRegion) -> Result<Arc<CodeRegion>> {
        let region = Arc::new(region);
        let mut guard = self.regions.write();

        let idx = guard.partition_point(|r| r.start < region.start);
        let overlaps_prev = idx > 0 && guard[idx - 1].end() > region.start;
        let overlaps_next = guard.get(idx).is_some_and(|next| next.start < region.end());
        if overlaps_prev || overlaps_next {
            return Err(UnwindError::RegionOverlap {
                start: region.start,
                end: region.end(),
            });
        }

        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend_from_slice(&guard[..idx]);
        next.push(Arc::clone(&region));
        next.extend_from_slice(&guard[idx..]);
        *guard = Arc::new(next);

        log::debug!(
            "registered {:?} region [{:#x}, {:#x}) for function {}",
            region.tier,
            region.start,
            region.end(),
            region.function_id
        );
        Ok(region)
    }

    /// Remove the region starting at `start`.
    ///
    /// Frames already captured keep the region alive through their own
    /// `Arc`, so retiring never invalidates an in-progress walk.
    pub fn retire(&self, start: u64) -> Option<Arc<CodeRegion>> {
        let mut guard = self.regions.write();
        let idx = guard.binary_search_by_key(&start, |r| r.start).ok()?;
        let mut next = Vec::clone(&guard);
        let removed = next.remove(idx);
        *guard = Arc::new(next);

        log::debug!(
            "retired region [{:#x}, {:#x}) for function {}",
            removed.start,
            removed.end(),
            removed.function_id
        );
        Some(removed)
    }

    /// Find the region containing `pc`.
    #[inline]
    pub fn lookup(&self, pc: u64) -> Option<Arc<CodeRegion>> {
        lookup_in(&self.snapshot(), pc).cloned()
    }

    /// The current set of regions, sorted by start.
    ///
    /// The read guard lives only for the `Arc` clone; writers hold the lock
    /// just long enough to swap in a vector they built beforehand. Walks
    /// call this once and search the snapshot without any lock.
    #[inline]
    pub fn snapshot(&self) -> RegionSnapshot {
        Arc::clone(&self.regions.read())
    }

    /// Number of registered regions.
    #[inline]
    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    /// Whether no region is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.regions.read().is_empty()
    }
}

/// Binary search a sorted region slice for the one containing `pc`.
pub fn lookup_in(regions: &[Arc<CodeRegion>], pc: u64) -> Option<&Arc<CodeRegion>> {
    let idx = regions.partition_point(|r| r.start <= pc);
    let candidate = regions.get(idx.checked_sub(1)?)?;
    candidate.contains(pc).then_some(candidate)
}

// =============================================================================
// Tests
// =============================================================================
