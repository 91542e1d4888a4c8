//! Callbacks into the rest of the runtime.

use crate::frame::{FrameInfo, PythonFrame, Statement};

/// Services the object model and interpreter provide to the unwinder.
///
/// Resolution differs by tier: compiled frames are usually answered from
/// per-version metadata, interpreted frames from a side table keyed by the
/// dispatch loop's base pointer.
pub trait RuntimeHooks {
    /// Function metadata for a frame, or `None` for frames that run
    /// runtime stubs rather than user code.
    fn frame_info(&self, frame: &PythonFrame) -> Option<FrameInfo>;

    /// The statement the frame is currently executing.
    fn current_statement(&self, frame: &PythonFrame) -> Option<Statement>;

    /// Finalize a frame the exception has finished unwinding through.
    fn cleanup_frame(&self, _frame: &PythonFrame) {}

    /// Drop one reference held in a scoped location.
    fn release_value(&self, _value: u64) {}

    /// Address of the return context saved for the generator whose entry
    /// trampoline frame has base pointer `bp`.
    fn generator_return_context(&self, _bp: u64) -> Option<u64> {
        None
    }
}

impl<H: RuntimeHooks + ?Sized> RuntimeHooks for &H {
    fn frame_info(&self, frame: &PythonFrame) -> Option<FrameInfo> {
        (**self).frame_info(frame)
    }

    fn current_statement(&self, frame: &PythonFrame) -> Option<Statement> {
        (**self).current_statement(frame)
    }

    fn cleanup_frame(&self, frame: &PythonFrame) {
        (**self).cleanup_frame(frame)
    }

    fn release_value(&self, value: u64) {
        (**self).release_value(value)
    }

    fn generator_return_context(&self, bp: u64) -> Option<u64> {
        (**self).generator_return_context(bp)
    }
}
