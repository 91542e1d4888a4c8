//! Per-statement exception counts.
//!
//! Statements that raise over and over are cheaper to run in a tier that
//! compiles the handler inline, so the unwinder counts exceptions per
//! `(function, statement)` and flags a statement once when it crosses the
//! promotion threshold.

use dashmap::DashMap;

/// Concurrent exception counter keyed by `(function id, statement id)`.
#[derive(Debug)]
pub struct ExceptionProfile {
    counts: DashMap<(u64, u32), u32>,
    threshold: u32,
}

impl ExceptionProfile {
    /// Create a profile that flags statements at `threshold` exceptions.
    /// A threshold of zero disables flagging.
    pub fn new(threshold: u32) -> Self {
        Self {
            counts: DashMap::new(),
            threshold,
        }
    }

    /// Count one exception. Returns `true` exactly when the count reaches
    /// the threshold.
    #[inline]
    pub fn record(&self, function_id: u64, statement_id: u32) -> bool {
        let mut count = self.counts.entry((function_id, statement_id)).or_insert(0);
        *count = count.saturating_add(1);
        self.threshold != 0 && *count == self.threshold
    }

    /// Current count for a statement.
    #[inline]
    pub fn count(&self, function_id: u64, statement_id: u32) -> u32 {
        self.counts
            .get(&(function_id, statement_id))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Forget every statement of a function (its code was replaced).
    pub fn reset_function(&self, function_id: u64) {
        self.counts.retain(|&(f, _), _| f != function_id);
    }

    /// Number of statements tracked.
    #[inline]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Promotion threshold.
    #[inline]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

// =============================================================================
// Tests
// =============================================================================
