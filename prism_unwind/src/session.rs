//! Per-thread state for one exception episode.
//!
//! ```text
//!            begin()                       end()
//!   idle ──────────────► active ────────────────────► idle
//!                         │  ▲
//!                 pause() │  │ resume(snapshot)
//!                         ▼  │
//!                   running frame cleanup
//! ```
//!
//! The session is threaded through the walker and driver as `&mut`, so the
//! borrow checker guarantees one active episode per thread. Nested raises
//! from landing-pad code are still possible at runtime and are caught by
//! [`UnwindSession::is_active`].
//!
//! Frame cleanup is deferred by one frame: a Python frame is finalized
//! only once the unwinder has moved past it, so a frame that catches never
//! runs its cleanup hook.

use std::time::{Duration, Instant};

use crate::config::UnwindConfig;
use crate::error::Result;
use crate::frame::PythonFrame;
use crate::hooks::RuntimeHooks;
use crate::memory::FrameMemory;
use crate::profile::ExceptionProfile;
use crate::stats::UnwindStats;
use crate::traceback::{Traceback, TracebackEntry};

// =============================================================================
// ExcInfo
// =============================================================================

/// The in-flight exception: three owned object references.
///
/// Landing pads receive a pointer to this block, so its layout is fixed:
/// three words in field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct ExcInfo {
    /// Exception type object.
    pub kind: u64,
    /// Exception instance.
    pub value: u64,
    /// Traceback object.
    pub traceback: u64,
}

impl ExcInfo {
    pub const fn new(kind: u64, value: u64, traceback: u64) -> Self {
        Self {
            kind,
            value,
            traceback,
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Session state set aside while cleanup code runs.
#[derive(Debug)]
#[must_use = "a paused session must be resumed"]
pub struct Snapshot {
    pending_frame: Option<PythonFrame>,
    exception: Option<ExcInfo>,
    reraise: bool,
}

impl Snapshot {
    /// The re-raise flag at the time of the pause.
    #[inline]
    pub fn reraise(&self) -> bool {
        self.reraise
    }
}

// =============================================================================
// Frame Context
// =============================================================================

/// Collaborators the session needs while visiting frames.
pub struct FrameContext<'a, H: ?Sized> {
    pub hooks: &'a H,
    /// Memory of the stack being unwound, for scoped releases.
    pub memory: &'a dyn FrameMemory,
    pub profile: &'a ExceptionProfile,
    pub stats: &'a UnwindStats,
    pub config: &'a UnwindConfig,
}

// =============================================================================
// UnwindSession
// =============================================================================

/// Bookkeeping for one exception as it propagates.
#[derive(Debug, Default)]
pub struct UnwindSession {
    active: bool,
    exception: Option<ExcInfo>,
    /// Last Python frame visited, finalized when the next frame is reached.
    pending_frame: Option<PythonFrame>,
    reraise: bool,
    traceback: Traceback,
    started: Option<Instant>,
    /// Base pointer of the frame whose cleanup pad is running.
    cleanup_frame_bp: Option<u64>,
}

impl UnwindSession {
    /// Create an idle session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an episode, discarding any previous state.
    pub fn begin(&mut self) {
        *self = Self {
            active: true,
            started: Some(Instant::now()),
            ..Self::default()
        };
    }

    /// Set aside the frame-tracking state and re-raise flag.
    ///
    /// The flag is cleared so code running during the pause does not see
    /// a stale re-raise.
    pub fn pause(&mut self) -> Snapshot {
        Snapshot {
            pending_frame: self.pending_frame.take(),
            exception: self.exception.take(),
            reraise: std::mem::take(&mut self.reraise),
        }
    }

    /// Restore state saved by [`pause`](Self::pause).
    pub fn resume(&mut self, snapshot: Snapshot) {
        self.pending_frame = snapshot.pending_frame;
        self.exception = snapshot.exception;
        self.reraise = snapshot.reraise;
    }

    /// Finish the episode and report how long it ran.
    pub fn end(&mut self) -> Duration {
        let elapsed = self.started.take().map_or(Duration::ZERO, |t| t.elapsed());
        self.active = false;
        self.pending_frame = None;
        self.cleanup_frame_bp = None;
        self.reraise = false;
        elapsed
    }

    /// Whether an episode is in progress.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Mark the in-flight exception as re-raised by a bare `raise`.
    ///
    /// The next Python frame visited keeps its existing traceback line.
    #[inline]
    pub fn mark_reraise(&mut self) {
        self.reraise = true;
    }

    #[inline]
    pub fn is_reraise(&self) -> bool {
        self.reraise
    }

    #[inline]
    pub fn has_pending_frame(&self) -> bool {
        self.pending_frame.is_some()
    }

    #[inline]
    pub fn pending_frame(&self) -> Option<&PythonFrame> {
        self.pending_frame.as_ref()
    }

    #[inline]
    pub fn exception(&self) -> Option<&ExcInfo> {
        self.exception.as_ref()
    }

    /// Address of the in-flight exception, as handed to landing pads.
    ///
    /// Zero when no exception is held. The address stays valid until the
    /// session moves or the exception is taken.
    #[inline]
    pub fn exception_address(&self) -> u64 {
        self.exception
            .as_ref()
            .map_or(0, |e| e as *const ExcInfo as u64)
    }

    #[inline]
    pub fn set_exception(&mut self, exception: ExcInfo) {
        self.exception = Some(exception);
    }

    /// Hand the exception to the catching frame.
    #[inline]
    pub fn take_exception(&mut self) -> Option<ExcInfo> {
        self.exception.take()
    }

    /// Traceback lines recorded so far, innermost first.
    #[inline]
    pub fn traceback(&self) -> &Traceback {
        &self.traceback
    }

    /// Move the traceback out, leaving an empty one.
    #[inline]
    pub fn take_traceback(&mut self) -> Traceback {
        std::mem::take(&mut self.traceback)
    }

    #[inline]
    pub(crate) fn cleanup_frame_bp(&self) -> Option<u64> {
        self.cleanup_frame_bp
    }

    #[inline]
    pub(crate) fn set_cleanup_frame_bp(&mut self, bp: Option<u64>) {
        self.cleanup_frame_bp = bp;
    }

    // =========================================================================
    // Per-frame bookkeeping
    // =========================================================================

    /// Account for one physical frame the exception is passing through.
    ///
    /// `frame` is the logical Python frame at this step, if any. The
    /// previously visited frame is finalized first; then a genuine Python
    /// frame becomes pending and contributes a traceback line.
    pub fn on_frame<H: RuntimeHooks + ?Sized>(
        &mut self,
        frame: Option<&PythonFrame>,
        cx: &FrameContext<'_, H>,
    ) -> Result<()> {
        self.finalize_pending(cx)?;

        let Some(frame) = frame else {
            return Ok(());
        };
        let Some(info) = cx.hooks.frame_info(frame) else {
            return Ok(());
        };
        self.pending_frame = Some(frame.clone());

        if self.reraise {
            self.reraise = false;
            return Ok(());
        }

        let statement = cx.hooks.current_statement(frame);
        if cx.config.traceback_has_room(self.traceback.len()) {
            self.traceback.push(TracebackEntry::new(&info, statement));
            cx.stats.record_traceback_entry();
        }
        if let Some(stmt) = statement {
            if cx.profile.record(info.function_id, stmt.id) {
                log::debug!(
                    "statement {} of function {} reached {} exceptions",
                    stmt.id,
                    info.function_id,
                    cx.profile.threshold()
                );
                cx.stats.record_promotion_candidate();
            }
        }
        Ok(())
    }

    /// Run the deferred cleanup of the pending frame, if any.
    pub fn finalize_pending<H: RuntimeHooks + ?Sized>(
        &mut self,
        cx: &FrameContext<'_, H>,
    ) -> Result<()> {
        let Some(frame) = self.pending_frame.take() else {
            return Ok(());
        };
        let saved = self.pause();
        let released = release_scoped_values(&frame, cx);
        cx.hooks.cleanup_frame(&frame);
        self.resume(saved);
        released
    }
}

/// Release the values a compiled frame holds at its current call site.
fn release_scoped_values<H: RuntimeHooks + ?Sized>(
    frame: &PythonFrame,
    cx: &FrameContext<'_, H>,
) -> Result<()> {
    let PythonFrame::Compiled {
        region, ip, regs, ..
    } = frame
    else {
        return Ok(());
    };
    for location in region.scoped_releases_at(*ip) {
        let value = location.resolve(regs, region.constants(), &cx.memory)?;
        cx.hooks.release_value(value);
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
