//! Exception unwinding driver.
//!
//! Takes the place of a personality routine: an ordinary loop decides, one
//! physical frame at a time, whether to keep unwinding or to land.
//!
//! ```text
//!            ┌─────────────── step ◄──────────────────────┐
//!            ▼                                             │
//!   no frame left ──► Fatal(NoHandler)                     │
//!            │                                             │
//!   no LSDA ─┼────────────────────────────────────────────►┤
//!            │                                             │
//!   find call site(pc) ── none ──► Fatal(NoCallSite)       │
//!            │                                             │
//!   no landing pad ───────────────────────────────────────►┘
//!            │
//!   action ── Cleanup ──► land(selector 0) ... resume_unwind_from_cleanup
//!            └─ Catch(v) ─► end session, land(selector v)
//! ```
//!
//! `pc` is the cursor's lookup address: one byte before the return address
//! for frames suspended in a call, so a call that ends its function still
//! resolves to that function.
//!
//! Landing writes the address of the session's [`ExcInfo`] (kind, value and
//! traceback) into RAX and the selector into RDX, sets the instruction
//! pointer to the landing pad and resumes the cursor.

use crate::classify::{FrameClassifier, FrameKind};
use crate::config::UnwindConfig;
use crate::cursor::StackCursor;
use crate::error::{Result, UnwindError, fatal};
use crate::hooks::RuntimeHooks;
use crate::lsda::{Action, Lsda};
use crate::profile::ExceptionProfile;
use crate::registers::{EH_DATA_PAYLOAD, EH_DATA_SELECTOR};
use crate::session::{ExcInfo, FrameContext, UnwindSession};
use crate::stats::UnwindStats;
use crate::walker::{PythonStackExtractor, WalkEvent, capture_frame};

use std::sync::Arc;

/// Where control was transferred.
///
/// Cursors over a live stack never return one: the landing replaces the
/// caller's frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Landed {
    /// Landing pad address.
    pub ip: u64,
    /// Base pointer of the landed frame.
    pub bp: u64,
    pub action: Action,
}

impl Landed {
    /// Selector value the landing pad received.
    #[inline]
    pub fn selector(&self) -> i64 {
        self.action.selector()
    }
}

// =============================================================================
// UnwindDriver
// =============================================================================

/// Per-call view over the engine's shared state.
pub struct UnwindDriver<'a, H: ?Sized> {
    classifier: &'a FrameClassifier,
    hooks: &'a H,
    config: &'a UnwindConfig,
    stats: &'a UnwindStats,
    profile: &'a ExceptionProfile,
}

impl<'a, H: RuntimeHooks + ?Sized> UnwindDriver<'a, H> {
    pub fn new(
        classifier: &'a FrameClassifier,
        hooks: &'a H,
        config: &'a UnwindConfig,
        stats: &'a UnwindStats,
        profile: &'a ExceptionProfile,
    ) -> Self {
        Self {
            classifier,
            hooks,
            config,
            stats,
            profile,
        }
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Start unwinding `exception` from the cursor's position.
    ///
    /// # Safety
    ///
    /// See [`StackCursor::resume`]: on a live stack every frame between
    /// the caller and the landing pad is discarded.
    pub unsafe fn try_raise_exception<C: StackCursor + ?Sized>(
        &self,
        cursor: &mut C,
        session: &mut UnwindSession,
        exception: ExcInfo,
    ) -> Result<Landed> {
        self.start_episode(session, exception, false)?;
        // SAFETY: forwarded from the caller.
        unsafe { self.unwind(cursor, session, None) }
    }

    /// Like [`try_raise_exception`](Self::try_raise_exception), for a bare
    /// `raise` of an exception that already has a line for the raising
    /// frame.
    ///
    /// # Safety
    ///
    /// See [`StackCursor::resume`].
    pub unsafe fn try_reraise_exception<C: StackCursor + ?Sized>(
        &self,
        cursor: &mut C,
        session: &mut UnwindSession,
        exception: ExcInfo,
    ) -> Result<Landed> {
        self.start_episode(session, exception, true)?;
        // SAFETY: forwarded from the caller.
        unsafe { self.unwind(cursor, session, None) }
    }

    /// Continue unwinding once a cleanup landing pad has finished.
    ///
    /// Frames up to and including the one whose cleanup just ran are
    /// skipped.
    ///
    /// # Safety
    ///
    /// See [`StackCursor::resume`].
    pub unsafe fn try_resume_unwind_from_cleanup<C: StackCursor + ?Sized>(
        &self,
        cursor: &mut C,
        session: &mut UnwindSession,
    ) -> Result<Landed> {
        if !session.is_active() {
            return Err(UnwindError::NoActiveSession);
        }
        let cleanup_bp = session.cleanup_frame_bp();
        session.set_cleanup_frame_bp(None);
        // SAFETY: forwarded from the caller.
        unsafe { self.unwind(cursor, session, cleanup_bp) }
    }

    /// [`try_raise_exception`](Self::try_raise_exception), aborting the
    /// process on failure.
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
        match unsafe { self.try_raise_exception(cursor, session, exception) } {
            Ok(landed) => landed,
            Err(e) => self.fatal(&e, session),
        }
    }

    /// [`try_reraise_exception`](Self::try_reraise_exception), aborting the
    /// process on failure.
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
        match unsafe { self.try_reraise_exception(cursor, session, exception) } {
            Ok(landed) => landed,
            Err(e) => self.fatal(&e, session),
        }
    }

    /// [`try_resume_unwind_from_cleanup`](Self::try_resume_unwind_from_cleanup),
    /// aborting the process on failure.
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
        match unsafe { self.try_resume_unwind_from_cleanup(cursor, session) } {
            Ok(landed) => landed,
            Err(e) => self.fatal(&e, session),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn start_episode(
        &self,
        session: &mut UnwindSession,
        exception: ExcInfo,
        reraise: bool,
    ) -> Result<()> {
        if session.is_active() {
            return Err(UnwindError::NestedUnwind);
        }
        session.begin();
        session.set_exception(exception);
        if reraise {
            session.mark_reraise();
        }
        self.stats.record_session_begun();
        log::debug!("unwinding exception {:#x}", exception.value);
        Ok(())
    }

    fn fatal(&self, error: &UnwindError, session: &UnwindSession) -> ! {
        let regions = self
            .config
            .dump_regions_on_fatal
            .then(|| &**self.classifier.regions());
        fatal(error, Some(session), regions)
    }

    /// Exception metadata for the current frame.
    fn lsda_for<C: StackCursor + ?Sized>(&self, kind: &FrameKind, cursor: &C) -> Option<Arc<Lsda>> {
        match kind {
            FrameKind::Compiled(region) => region.lsda().cloned(),
            FrameKind::Interpreted => self
                .classifier
                .interpreter_lsda()
                .cloned()
                .or_else(|| cursor.lsda()),
            _ => cursor.lsda(),
        }
    }

    /// Code range a landing pad of this frame must fall in, when known.
    fn landing_range(&self, kind: &FrameKind) -> Option<(u64, u64)> {
        match kind {
            FrameKind::Compiled(region) => Some((region.start(), region.end())),
            FrameKind::Interpreted => {
                let range = self.classifier.interpreter();
                (!range.is_empty()).then_some((range.start, range.end))
            }
            _ => None,
        }
    }

    unsafe fn unwind<C: StackCursor + ?Sized>(
        &self,
        cursor: &mut C,
        session: &mut UnwindSession,
        mut skip_through_bp: Option<u64>,
    ) -> Result<Landed> {
        let classifier = self.classifier.pin();
        let mut extractor = PythonStackExtractor::new();
        let mut frames = 0usize;

        loop {
            if !cursor.step()? {
                return Err(UnwindError::NoHandler { frames });
            }
            frames += 1;
            if frames > self.config.max_walk_depth {
                return Err(UnwindError::WalkTooDeep(self.config.max_walk_depth));
            }

            let (ip, bp, pc) = (cursor.ip(), cursor.bp(), cursor.lookup_pc());
            let kind = classifier.classify(pc);
            let event = match kind {
                FrameKind::DeoptTrampoline => Some(WalkEvent::DeoptTrampoline { ip, bp }),
                ref other => capture_frame(&*cursor, other).map(WalkEvent::Python),
            };
            let logical = event.and_then(|e| extractor.accept(e));

            if let Some(target) = skip_through_bp {
                if bp == target {
                    skip_through_bp = None;
                }
                log::trace!("skipping frame ip={ip:#x} bp={bp:#x} after cleanup");
                continue;
            }

            let cx = FrameContext {
                hooks: self.hooks,
                memory: cursor.memory(),
                profile: self.profile,
                stats: self.stats,
                config: self.config,
            };
            session.on_frame(logical.as_ref(), &cx)?;
            self.stats.record_frame_unwound();

            let Some(lsda) = self.lsda_for(&kind, &*cursor) else {
                continue;
            };

            let entry = lsda
                .find_call_site_entry(pc)?
                .ok_or(UnwindError::NoCallSiteEntry { pc })?;
            let Some(landing_pad) = entry.landing_pad else {
                continue;
            };

            if self.config.verify_landing_pads {
                if let Some((start, end)) = self.landing_range(&kind) {
                    if landing_pad < start || landing_pad >= end {
                        return Err(UnwindError::LandingPadOutOfRange {
                            landing_pad,
                            start,
                            end,
                        });
                    }
                }
            }

            let action = lsda.determine_action(&entry)?;
            let payload = session.exception_address();
            match action {
                Action::Cleanup => {
                    session.set_cleanup_frame_bp(Some(bp));
                    self.stats.record_cleanup_landing();
                }
                Action::Catch(_) => {
                    self.stats.record_session_ended(session.end());
                    self.stats.record_catch_landing();
                }
            }

            log::debug!(
                "landing at {landing_pad:#x} (bp={bp:#x}, {action:?}) after {frames} frames"
            );
            cursor.set_register(EH_DATA_PAYLOAD, payload)?;
            cursor.set_register(EH_DATA_SELECTOR, action.selector() as u64)?;
            cursor.set_ip(landing_pad);
            // SAFETY: forwarded from the caller.
            unsafe { cursor.resume()? };

            return Ok(Landed {
                ip: landing_pad,
                bp,
                action,
            });
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::AddressRange;
    use crate::cursor::{SnapshotCursor, SnapshotFrame};
    use crate::frame::{FrameInfo, PythonFrame, Statement};
    use crate::lsda::encode::LsdaBuilder;
    use crate::lsda::call_site::DW_EH_PE_ULEB128;
    use crate::region::{CodeRegion, RegionTable, Tier};
    use gimli::X86_64;
    use std::cell::RefCell;

    const EXC: ExcInfo = ExcInfo::new(0x10, 0xE0, 0x20);

    #[derive(Default)]
    struct Hooks {
        cleaned: RefCell<Vec<u64>>,
    }

    impl RuntimeHooks for Hooks {
        fn frame_info(&self, frame: &PythonFrame) -> Option<FrameInfo> {
            let id = frame.region().map_or(0, |r| r.function_id());
            Some(FrameInfo::new(id, format!("f{id}"), "d.py"))
        }

        fn current_statement(&self, _frame: &PythonFrame) -> Option<Statement> {
            Some(Statement { id: 1, line: 1 })
        }

        fn cleanup_frame(&self, frame: &PythonFrame) {
            self.cleaned.borrow_mut().push(frame.bp());
        }
    }

    struct Fixture {
        classifier: FrameClassifier,
        config: UnwindConfig,
        stats: UnwindStats,
        profile: ExceptionProfile,
        hooks: Hooks,
    }

    impl Fixture {
        fn new(regions: Vec<CodeRegion>) -> Self {
            let table = Arc::new(RegionTable::new());
            for region in regions {
                table.register(region).unwrap();
            }
            Self {
                classifier: FrameClassifier::new(table)
                    .with_interpreter(AddressRange::new(0x5000, 0x6000)),
                config: UnwindConfig::default(),
                stats: UnwindStats::new(),
                profile: ExceptionProfile::new(100),
                hooks: Hooks::default(),
            }
        }

        fn driver(&self) -> UnwindDriver<'_, Hooks> {
            UnwindDriver::new(
                &self.classifier,
                &self.hooks,
                &self.config,
                &self.stats,
                &self.profile,
            )
        }
    }

    /// f at 0x1000: call site [0x10, 0x18) has a cleanup pad at 0x80.
    fn cleanup_region() -> CodeRegion {
        let mut lsda = LsdaBuilder::new(DW_EH_PE_ULEB128);
        lsda.call_site(0x10, 0x8, Some(0x80), None);
        CodeRegion::new(0x1000, 0x100, Tier::Baseline, 1).with_lsda(lsda.finish())
    }

    /// g at 0x2000: call site [0x20, 0x28) catches with selector 2.
    fn catch_region() -> CodeRegion {
        let mut lsda = LsdaBuilder::new(DW_EH_PE_ULEB128);
        let chain = lsda.action_chain(&[0, 2]);
        lsda.call_site(0x20, 0x8, Some(0x90), Some(chain));
        CodeRegion::new(0x2000, 0x100, Tier::Optimized, 2).with_lsda(lsda.finish())
    }

    #[test]
    fn test_cleanup_then_catch() {
        let fx = Fixture::new(vec![cleanup_region(), catch_region()]);
        let driver = fx.driver();
        let mut session = UnwindSession::new();
        let mut cursor = SnapshotCursor::new(vec![
            SnapshotFrame::new(0x9000, 0x6f00, 0x6f80), // runtime raise stub
            SnapshotFrame::new(0x1011, 0x7000, 0x7100),
            SnapshotFrame::new(0x2021, 0x7110, 0x7200),
        ]);

        let landed = unsafe { driver.try_raise_exception(&mut cursor, &mut session, EXC) }.unwrap();
        assert_eq!(landed.ip, 0x1080);
        assert_eq!(landed.selector(), 0);
        assert!(session.is_active());
        let landing = cursor.landing().unwrap();
        assert_eq!(landing.regs.get(X86_64::RAX), Ok(session.exception_address()));
        assert_eq!(landing.regs.get(X86_64::RDX), Ok(0));
        assert!(fx.hooks.cleaned.borrow().is_empty());

        let mut resumed = cursor.after_landing().unwrap();
        let landed =
            unsafe { driver.try_resume_unwind_from_cleanup(&mut resumed, &mut session) }.unwrap();
        assert_eq!(landed.ip, 0x2090);
        assert_eq!(landed.action, Action::Catch(2));
        let regs = resumed.landing().unwrap().regs;
        assert_eq!(regs.get(X86_64::RDX), Ok(2));
        // The catching pad sees the whole exception, not just its value.
        let payload = regs.get(X86_64::RAX).unwrap();
        assert_eq!(payload, session.exception_address());
        // SAFETY: the session is live and still holds the exception.
        assert_eq!(unsafe { *(payload as *const ExcInfo) }, EXC);

        // f was finalized on the way out; g caught and was not.
        assert_eq!(*fx.hooks.cleaned.borrow(), vec![0x7100]);
        assert!(!session.is_active());
        assert_eq!(session.traceback().len(), 2);
        assert_eq!(fx.stats.cleanup_landings(), 1);
        assert_eq!(fx.stats.catch_landings(), 1);
        assert_eq!(fx.stats.sessions_ended(), 1);
    }

    #[test]
    fn test_call_ending_the_region_is_handled() {
        // The throwing call occupies the last bytes of f, so the return
        // address is f's end.
        let mut lsda = LsdaBuilder::new(DW_EH_PE_ULEB128);
        let chain = lsda.action_chain(&[4]);
        lsda.call_site(0xF8, 0x8, Some(0x80), Some(chain));
        let tail = CodeRegion::new(0x1000, 0x100, Tier::Optimized, 1).with_lsda(lsda.finish());
        let fx = Fixture::new(vec![tail]);
        let mut session = UnwindSession::new();
        let mut cursor = SnapshotCursor::new(vec![SnapshotFrame::new(0x1100, 0x7000, 0x7100)]);

        let landed =
            unsafe { fx.driver().try_raise_exception(&mut cursor, &mut session, EXC) }.unwrap();
        assert_eq!(landed.ip, 0x1080);
        assert_eq!(landed.action, Action::Catch(4));
        assert_eq!(session.traceback().len(), 1);
    }

    #[test]
    fn test_nested_raise_rejected() {
        let fx = Fixture::new(vec![catch_region()]);
        let mut session = UnwindSession::new();
        session.begin();
        let mut cursor = SnapshotCursor::new(vec![SnapshotFrame::new(0x2021, 0x7000, 0x7100)]);
        let err = unsafe { fx.driver().try_raise_exception(&mut cursor, &mut session, EXC) };
        assert_eq!(err, Err(UnwindError::NestedUnwind));
    }

    #[test]
    fn test_resume_without_session_rejected() {
        let fx = Fixture::new(vec![]);
        let mut session = UnwindSession::new();
        let mut cursor = SnapshotCursor::new(vec![]);
        let err = unsafe { fx.driver().try_resume_unwind_from_cleanup(&mut cursor, &mut session) };
        assert_eq!(err, Err(UnwindError::NoActiveSession));
    }

    #[test]
    fn test_exhausted_stack_has_no_handler() {
        let fx = Fixture::new(vec![cleanup_region()]);
        let mut session = UnwindSession::new();
        let mut cursor = SnapshotCursor::new(vec![
            SnapshotFrame::new(0x9000, 0x6f00, 0x6f80),
            SnapshotFrame::new(0x5010, 0x7000, 0x7100),
        ]);
        let err = unsafe { fx.driver().try_raise_exception(&mut cursor, &mut session, EXC) };
        assert_eq!(err, Err(UnwindError::NoHandler { frames: 2 }));
    }

    #[test]
    fn test_uncovered_pc_is_fatal() {
        let fx = Fixture::new(vec![cleanup_region()]);
        let mut session = UnwindSession::new();
        let mut cursor = SnapshotCursor::new(vec![SnapshotFrame::new(0x1041, 0x7000, 0x7100)]);
        let err = unsafe { fx.driver().try_raise_exception(&mut cursor, &mut session, EXC) };
        assert_eq!(err, Err(UnwindError::NoCallSiteEntry { pc: 0x1040 }));
    }

    #[test]
    fn test_site_without_landing_pad_continues() {
        let mut lsda = LsdaBuilder::new(DW_EH_PE_ULEB128);
        lsda.call_site(0x10, 0x8, None, None);
        let quiet = CodeRegion::new(0x3000, 0x100, Tier::Baseline, 3).with_lsda(lsda.finish());
        let fx = Fixture::new(vec![quiet, catch_region()]);
        let mut session = UnwindSession::new();
        let mut cursor = SnapshotCursor::new(vec![
            SnapshotFrame::new(0x3011, 0x7000, 0x7100),
            SnapshotFrame::new(0x2021, 0x7110, 0x7200),
        ]);
        let landed =
            unsafe { fx.driver().try_raise_exception(&mut cursor, &mut session, EXC) }.unwrap();
        assert_eq!(landed.bp, 0x7200);
        assert_eq!(fx.stats.frames_unwound(), 2);
    }

    #[test]
    fn test_landing_pad_outside_region_rejected() {
        let mut lsda = LsdaBuilder::new(DW_EH_PE_ULEB128);
        lsda.call_site(0x10, 0x8, Some(0x400), None);
        let bad = CodeRegion::new(0x1000, 0x100, Tier::Baseline, 1).with_lsda(lsda.finish());
        let fx = Fixture::new(vec![bad]);
        let mut session = UnwindSession::new();
        let mut cursor = SnapshotCursor::new(vec![SnapshotFrame::new(0x1011, 0x7000, 0x7100)]);
        let err = unsafe { fx.driver().try_raise_exception(&mut cursor, &mut session, EXC) };
        assert_eq!(
            err,
            Err(UnwindError::LandingPadOutOfRange {
                landing_pad: 0x1400,
                start: 0x1000,
                end: 0x1100
            })
        );
        assert!(cursor.landing().is_none());
    }

    #[test]
    fn test_reraise_skips_first_traceback_line() {
        let fx = Fixture::new(vec![cleanup_region(), catch_region()]);
        let mut session = UnwindSession::new();
        let mut cursor = SnapshotCursor::new(vec![
            SnapshotFrame::new(0x2021, 0x7110, 0x7200),
        ]);
        unsafe { fx.driver().try_reraise_exception(&mut cursor, &mut session, EXC) }.unwrap();
        assert!(session.traceback().is_empty());
    }

    #[test]
    fn test_interpreter_lsda_used_for_interpreted_frames() {
        let mut lsda = LsdaBuilder::new(DW_EH_PE_ULEB128);
        let chain = lsda.action_chain(&[7]);
        lsda.call_site(0x100, 0x10, Some(0x800), Some(chain));
        let mut fx = Fixture::new(vec![]);
        fx.classifier = fx.classifier.with_interpreter_lsda(lsda.finish());
        let mut session = UnwindSession::new();
        let mut cursor = SnapshotCursor::new(vec![SnapshotFrame::new(0x5105, 0x7000, 0x7100)]);
        let landed =
            unsafe { fx.driver().try_raise_exception(&mut cursor, &mut session, EXC) }.unwrap();
        assert_eq!(landed.ip, 0x5800);
        assert_eq!(landed.action, Action::Catch(7));
    }
}
