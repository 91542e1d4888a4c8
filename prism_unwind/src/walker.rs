//! Cross-tier stack walking.
//!
//! The walk runs in two layers:
//!
//! 1. [`FrameWalker::walk`] steps the physical stack, classifies every
//!    frame, drops foreign frames and splices generator resumers in place
//!    of a generator's physical caller.
//! 2. [`PythonStackExtractor`] turns that stream into logical Python
//!    frames, dropping the shadow copies that deoptimization and OSR leave
//!    behind.
//!
//! ```text
//!   physical                      logical
//!   ────────────────────────      ─────────────────
//!   Compiled  f (osr)        ──►  f
//!   Interpreted f (entered osr)   (dropped)
//!   Foreign   runtime             (skipped)
//!   DeoptTrampoline               (marker)
//!   Interpreted g (shadow)        (dropped)
//!   Interpreted g             ──► g
//!   GeneratorEntry  ── splice ──► resumer frames...
//! ```

use crate::classify::{FrameClassifier, FrameKind};
use crate::cursor::StackCursor;
use crate::error::{Result, UnwindError};
use crate::frame::PythonFrame;
use crate::hooks::RuntimeHooks;
use crate::registers::CALLEE_SAVED;
use crate::traceback::{Traceback, TracebackEntry};

// =============================================================================
// Visit Protocol
// =============================================================================

/// Whether a walk should continue after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameVisit {
    Continue,
    Stop,
}

/// One interesting physical frame.
#[derive(Debug, Clone)]
pub enum WalkEvent {
    /// A frame owned by Python code.
    Python(PythonFrame),
    /// The deoptimization trampoline; the next Python frame is a shadow.
    DeoptTrampoline { ip: u64, bp: u64 },
}

/// Build the Python frame for the cursor's current position, if the
/// classification says it is one.
pub fn capture_frame<C: StackCursor + ?Sized>(cursor: &C, kind: &FrameKind) -> Option<PythonFrame> {
    match kind {
        FrameKind::Compiled(region) => {
            let regs = cursor.registers();
            if log::log_enabled!(log::Level::Trace) {
                let missing = CALLEE_SAVED
                    .iter()
                    .filter(|&&r| !regs.is_available(r))
                    .count();
                if missing > 0 {
                    log::trace!(
                        "{missing} callee-saved registers unavailable at {:#x}",
                        cursor.ip()
                    );
                }
            }
            Some(PythonFrame::Compiled {
                region: region.clone(),
                ip: cursor.ip(),
                bp: cursor.bp(),
                sp: cursor.sp(),
                regs,
            })
        }
        FrameKind::Interpreted => Some(PythonFrame::Interpreted {
            ip: cursor.ip(),
            bp: cursor.bp(),
        }),
        _ => None,
    }
}

// =============================================================================
// PythonStackExtractor
// =============================================================================

/// Single-pass filter from physical events to logical Python frames.
#[derive(Debug, Clone, Default)]
pub struct PythonStackExtractor {
    skip_next: bool,
}

impl PythonStackExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event; returns the logical frame it yields, if any.
    pub fn accept(&mut self, event: WalkEvent) -> Option<PythonFrame> {
        match event {
            WalkEvent::DeoptTrampoline { .. } => {
                self.skip_next = true;
                None
            }
            WalkEvent::Python(frame) => {
                if std::mem::take(&mut self.skip_next) {
                    log::trace!("dropping shadow frame {frame:?}");
                    return None;
                }
                // The interpreter frame that entered OSR is the same
                // logical frame as this one.
                self.skip_next = frame.is_osr();
                Some(frame)
            }
        }
    }
}

// =============================================================================
// FrameWalker
// =============================================================================

/// Drives a [`StackCursor`] across tiers.
pub struct FrameWalker<'a, H: ?Sized> {
    classifier: &'a FrameClassifier,
    hooks: &'a H,
    max_depth: usize,
}

impl<'a, H: RuntimeHooks + ?Sized> FrameWalker<'a, H> {
    pub fn new(classifier: &'a FrameClassifier, hooks: &'a H, max_depth: usize) -> Self {
        Self {
            classifier,
            hooks,
            max_depth,
        }
    }

    /// Step the physical stack, splicing through generator entries.
    pub fn walk<C, F>(&self, cursor: &mut C, mut visit: F) -> Result<()>
    where
        C: StackCursor + ?Sized,
        F: FnMut(WalkEvent) -> FrameVisit,
    {
        let classifier = self.classifier.pin();
        let mut depth = 0usize;
        let mut advance = true;
        loop {
            if advance && !cursor.step()? {
                return Ok(());
            }
            advance = true;

            depth += 1;
            if depth > self.max_depth {
                return Err(UnwindError::WalkTooDeep(self.max_depth));
            }

            let kind = classifier.classify(cursor.lookup_pc());
            log::trace!(
                "walk frame {depth}: ip={:#x} bp={:#x} {kind:?}",
                cursor.ip(),
                cursor.bp()
            );

            let event = match kind {
                FrameKind::GeneratorEntry => {
                    let bp = cursor.bp();
                    let context = self
                        .hooks
                        .generator_return_context(bp)
                        .ok_or(UnwindError::MissingReturnContext { bp })?;
                    cursor.reanchor(context)?;
                    advance = false;
                    continue;
                }
                FrameKind::DeoptTrampoline => WalkEvent::DeoptTrampoline {
                    ip: cursor.ip(),
                    bp: cursor.bp(),
                },
                FrameKind::Foreign => continue,
                ref python => match capture_frame(&*cursor, python) {
                    Some(frame) => WalkEvent::Python(frame),
                    None => continue,
                },
            };

            if visit(event) == FrameVisit::Stop {
                return Ok(());
            }
        }
    }

    /// Visit every logical Python frame, innermost first.
    pub fn for_each_frame<C, F>(&self, cursor: &mut C, mut visit: F) -> Result<()>
    where
        C: StackCursor + ?Sized,
        F: FnMut(&PythonFrame) -> FrameVisit,
    {
        let mut extractor = PythonStackExtractor::new();
        self.walk(cursor, |event| match extractor.accept(event) {
            Some(frame) => visit(&frame),
            None => FrameVisit::Continue,
        })
    }

    /// Traceback of the stack as it stands, one line per logical frame.
    pub fn current_traceback<C>(&self, cursor: &mut C) -> Result<Traceback>
    where
        C: StackCursor + ?Sized,
    {
        let mut traceback = Traceback::new();
        self.for_each_frame(cursor, |frame| {
            if let Some(info) = self.hooks.frame_info(frame) {
                let statement = self.hooks.current_statement(frame);
                traceback.push(TracebackEntry::new(&info, statement));
            }
            FrameVisit::Continue
        })?;
        Ok(traceback)
    }
}

// =============================================================================
// Tests
// =============================================================================
