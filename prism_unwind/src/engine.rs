//! Process-wide unwinder façade.
//!
//! [`UnwindEngine`] owns the state shared by every thread (classifier,
//! CFI table, configuration, statistics and the exception profile) and hands out the
//! short-lived [`FrameWalker`] and [`UnwindDriver`] views that do the work.
//! Per-thread state lives in the caller's [`UnwindSession`].

use std::sync::Arc;

use crate::classify::{FrameClassifier, FrameKind};
use crate::config::UnwindConfig;
use crate::cursor::{CfiTable, NativeCursor, StackCursor};
use crate::deopt::{self, DeoptState};
use crate::driver::{Landed, UnwindDriver};
use crate::error::Result;
use crate::frame::PythonFrame;
use crate::hooks::RuntimeHooks;
use crate::memory::{FrameMemory, NativeMemory};
use crate::profile::ExceptionProfile;
use crate::region::RegionTable;
use crate::session::{ExcInfo, UnwindSession};
use crate::stats::UnwindStats;
use crate::traceback::Traceback;
use crate::walker::{FrameVisit, FrameWalker};

/// Stack walking, deopt recovery and exception unwinding for one runtime.
pub struct UnwindEngine<H> {
    classifier: FrameClassifier,
    cfi: Arc<CfiTable>,
    config: UnwindConfig,
    stats: UnwindStats,
    profile: ExceptionProfile,
    hooks: H,
}

impl<H: RuntimeHooks> UnwindEngine<H> {
    pub fn new(classifier: FrameClassifier, hooks: H, config: UnwindConfig) -> Self {
        log::debug!("unwind engine configured: {config:?}");
        Self {
            profile: ExceptionProfile::new(config.promotion_threshold),
            classifier,
            cfi: Arc::default(),
            config,
            stats: UnwindStats::new(),
            hooks,
        }
    }

    /// Share an existing CFI table instead of starting with an empty one.
    pub fn with_cfi(mut self, cfi: Arc<CfiTable>) -> Self {
        self.cfi = cfi;
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn classifier(&self) -> &FrameClassifier {
        &self.classifier
    }

    #[inline]
    pub fn regions(&self) -> &Arc<RegionTable> {
        self.classifier.regions()
    }

    /// CFI for JIT output and runtime code, used by native cursors.
    #[inline]
    pub fn cfi(&self) -> &Arc<CfiTable> {
        &self.cfi
    }

    #[inline]
    pub fn config(&self) -> &UnwindConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> &UnwindStats {
        &self.stats
    }

    #[inline]
    pub fn profile(&self) -> &ExceptionProfile {
        &self.profile
    }

    #[inline]
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// A walker bound to this engine.
    pub fn walker(&self) -> FrameWalker<'_, H> {
        FrameWalker::new(&self.classifier, &self.hooks, self.config.max_walk_depth)
    }

    /// A driver bound to this engine.
    pub fn driver(&self) -> UnwindDriver<'_, H> {
        UnwindDriver::new(
            &self.classifier,
            &self.hooks,
            &self.config,
            &self.stats,
            &self.profile,
        )
    }

    /// Cursor positioned on the calling function's frame.
    #[inline(always)]
    pub fn capture(&self) -> Result<NativeCursor> {
        NativeCursor::capture(Arc::clone(&self.cfi))
    }

    /// Create an idle session for a new thread.
    pub fn new_session(&self) -> UnwindSession {
        UnwindSession::new()
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Classify a code address.
    #[inline]
    pub fn classify(&self, pc: u64) -> FrameKind {
        self.classifier.classify(pc)
    }

    /// Visit every logical Python frame on the cursor's stack.
    pub fn for_each_frame<C, F>(&self, cursor: &mut C, visit: F) -> Result<()>
    where
        C: StackCursor + ?Sized,
        F: FnMut(&PythonFrame) -> FrameVisit,
    {
        self.walker().for_each_frame(cursor, visit)
    }

    /// Traceback of the cursor's stack.
    pub fn current_traceback<C: StackCursor + ?Sized>(&self, cursor: &mut C) -> Result<Traceback> {
        self.walker().current_traceback(cursor)
    }

    /// Deopt state of a compiled frame on a stack in this address space.
    pub fn build_deopt_state(&self, frame: &PythonFrame) -> Result<DeoptState> {
        self.build_deopt_state_with(frame, &NativeMemory)
    }

    /// Deopt state of a compiled frame, reading stack slots from `memory`.
    pub fn build_deopt_state_with<M: FrameMemory>(
        &self,
        frame: &PythonFrame,
        memory: &M,
    ) -> Result<DeoptState> {
        let state = deopt::build_deopt_state(frame, &self.hooks, memory)?;
        self.stats.record_deopt_state();
        Ok(state)
    }

    /// Bound locals of a compiled frame, as `locals()` reports them.
    pub fn frame_locals<M: FrameMemory>(
        &self,
        frame: &PythonFrame,
        memory: &M,
    ) -> Result<Vec<(Arc<str>, u64)>> {
        Ok(self.build_deopt_state_with(frame, memory)?.locals)
    }

    // =========================================================================
    // Unwinding
    // =========================================================================

    /// Raise `exception`, aborting the process on an unwinder fault.
    ///
    /// # Safety
    ///
    /// See [`StackCursor::resume`].
    pub unsafe fn raise_exception<C: StackCursor + ?Sized>(
        &self,
        cursor: &mut C,
        session: &mut UnwindSession,
        exception: ExcInfo,
    ) -> Landed {
        // SAFETY: forwarded from the caller.
        unsafe { self.driver().raise_exception(cursor, session, exception) }
    }

    /// Re-raise `exception` from a bare `raise`.
    ///
    /// # Safety
    ///
    /// See [`StackCursor::resume`].
    pub unsafe fn reraise_exception<C: StackCursor + ?Sized>(
        &self,
        cursor: &mut C,
        session: &mut UnwindSession,
        exception: ExcInfo,
    ) -> Landed {
        // SAFETY: forwarded from the caller.
        unsafe { self.driver().reraise_exception(cursor, session, exception) }
    }

    /// Continue unwinding after a cleanup landing pad.
    ///
    /// # Safety
    ///
    /// See [`StackCursor::resume`].
    pub unsafe fn resume_unwind_from_cleanup<C: StackCursor + ?Sized>(
        &self,
        cursor: &mut C,
        session: &mut UnwindSession,
    ) -> Landed {
        // SAFETY: forwarded from the caller.
        unsafe { self.driver().resume_unwind_from_cleanup(cursor, session) }
    }
}

// =============================================================================
// Tests
// =============================================================================
