//! Unwinder statistics.
//!
//! Counters are updated with relaxed atomics from whichever thread is
//! unwinding; they are diagnostics only and never drive decisions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// =============================================================================
// UnwindStats
// =============================================================================

/// Process-wide unwinding counters.
#[derive(Debug, Default)]
pub struct UnwindStats {
    /// Exception episodes started.
    sessions_begun: AtomicU64,
    /// Exception episodes finished by a catch.
    sessions_ended: AtomicU64,
    /// Physical frames stepped while an exception was in flight.
    frames_unwound: AtomicU64,
    /// Landings for cleanup.
    cleanup_landings: AtomicU64,
    /// Landings for catch.
    catch_landings: AtomicU64,
    /// Traceback lines recorded.
    traceback_entries: AtomicU64,
    /// Statements reported as tier-promotion candidates.
    promotion_candidates: AtomicU64,
    /// Deopt states materialized.
    deopt_states_built: AtomicU64,
    /// Sum of session durations (nanoseconds).
    total_session_ns: AtomicU64,
    /// Longest session seen (nanoseconds).
    max_session_ns: AtomicU64,
}

impl UnwindStats {
    /// Create zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_session_begun(&self) {
        self.sessions_begun.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished session and its duration.
    pub fn record_session_ended(&self, duration: Duration) {
        self.sessions_ended.fetch_add(1, Ordering::Relaxed);
        let nanos = duration.as_nanos() as u64;
        self.total_session_ns.fetch_add(nanos, Ordering::Relaxed);
        self.max_session_ns.fetch_max(nanos, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_unwound(&self) {
        self.frames_unwound.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cleanup_landing(&self) {
        self.cleanup_landings.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_catch_landing(&self) {
        self.catch_landings.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_traceback_entry(&self) {
        self.traceback_entries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_promotion_candidate(&self) {
        self.promotion_candidates.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_deopt_state(&self) {
        self.deopt_states_built.fetch_add(1, Ordering::Relaxed);
    }

    // =========================================================================
    // Getters
    // =========================================================================

    #[inline]
    pub fn sessions_begun(&self) -> u64 {
        self.sessions_begun.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sessions_ended(&self) -> u64 {
        self.sessions_ended.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_unwound(&self) -> u64 {
        self.frames_unwound.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn cleanup_landings(&self) -> u64 {
        self.cleanup_landings.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn catch_landings(&self) -> u64 {
        self.catch_landings.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn traceback_entries(&self) -> u64 {
        self.traceback_entries.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn promotion_candidates(&self) -> u64 {
        self.promotion_candidates.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn deopt_states_built(&self) -> u64 {
        self.deopt_states_built.load(Ordering::Relaxed)
    }

    /// Average duration of finished sessions.
    pub fn avg_session_time(&self) -> Duration {
        let count = self.sessions_ended();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_session_ns.load(Ordering::Relaxed) / count)
    }

    /// Longest finished session.
    #[inline]
    pub fn max_session_time(&self) -> Duration {
        Duration::from_nanos(self.max_session_ns.load(Ordering::Relaxed))
    }

    /// Reset all counters.
    pub fn reset(&self) {
        for counter in [
            &self.sessions_begun,
            &self.sessions_ended,
            &self.frames_unwound,
            &self.cleanup_landings,
            &self.catch_landings,
            &self.traceback_entries,
            &self.promotion_candidates,
            &self.deopt_states_built,
            &self.total_session_ns,
            &self.max_session_ns,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl fmt::Display for UnwindStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Unwind Statistics:")?;
        writeln!(f, "  Sessions:        {} begun, {} caught", self.sessions_begun(), self.sessions_ended())?;
        writeln!(f, "  Frames Unwound:  {}", self.frames_unwound())?;
        writeln!(f, "  Landings:        {} cleanup, {} catch", self.cleanup_landings(), self.catch_landings())?;
        writeln!(f, "  Traceback Lines: {}", self.traceback_entries())?;
        writeln!(f, "  Promotions:      {}", self.promotion_candidates())?;
        writeln!(f, "  Deopt States:    {}", self.deopt_states_built())?;
        writeln!(f, "  Avg Session:     {:?}", self.avg_session_time())?;
        write!(f, "  Max Session:     {:?}", self.max_session_time())
    }
}

// =============================================================================
// Tests
// =============================================================================
