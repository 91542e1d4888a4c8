//! Prism Cross-Tier Unwinder
//!
//! Stack walking, exception unwinding and deoptimization state recovery for
//! a runtime where interpreted, baseline and optimized frames are freely
//! interleaved on one native stack.
//!
//! # Architecture
//!
//! ```text
//!   StackCursor ──► FrameClassifier ──► FrameWalker ──► PythonStackExtractor
//!   (step/resume)   (pc → FrameKind)    (splice gens)   (drop shadow frames)
//!                          │                                   │
//!                          ▼                                   ▼
//!                     RegionTable                   traceback / locals()
//!                  (StackMap + LSDA                  build_deopt_state
//!                   per version)
//!                          │
//!                          ▼
//!                    UnwindDriver ──► UnwindSession ──► RuntimeHooks
//!                (call site → action)  (per-thread)     (cleanup, info)
//! ```
//!
//! - **Stack maps** name the location of every live value at each call
//!   site; the deopt builder resolves them against a frame's registers.
//! - **LSDAs** map call sites to landing pads and action chains; the driver
//!   uses them in place of a personality routine.
//! - **Sessions** carry one exception episode per thread and are passed as
//!   `&mut`, never stored in thread-local state.
//!
//! # Failure model
//!
//! Every [`UnwindError`] is a contract violation between code generation and
//! the runtime. Internal layers return `Result`; the non-`try_` entry points
//! hand errors to [`error::fatal`], which dumps diagnostics and aborts.
//!
//! # Usage
//!
//! ```ignore
//! use prism_unwind::{FrameClassifier, RegionTable, UnwindConfig, UnwindEngine};
//!
//! let regions = Arc::new(RegionTable::new());
//! let classifier = FrameClassifier::new(regions.clone())
//!     .with_interpreter(interpreter_range)
//!     .with_generator_entry(generator_entry_range);
//! let engine = UnwindEngine::new(classifier, hooks, UnwindConfig::from_env());
//!
//! let mut cursor = engine.capture()?;
//! let traceback = engine.current_traceback(&mut cursor)?;
//! ```
#![deny(unsafe_op_in_unsafe_fn)]

pub mod classify;
pub mod config;
pub mod cursor;
pub mod deopt;
pub mod driver;
pub mod engine;
pub mod error;
pub mod frame;
pub mod generator;
pub mod hooks;
pub mod lsda;
pub mod memory;
pub mod profile;
pub mod region;
pub mod registers;
pub mod session;
pub mod stackmap;
pub mod stats;
pub mod traceback;
pub mod walker;

pub use classify::{AddressRange, FrameClassifier, FrameKind};
pub use config::UnwindConfig;
pub use cursor::{
    CfiSection, CfiTable, NativeCursor, SnapshotCursor, SnapshotFrame, SnapshotMemory, StackCursor,
};
pub use deopt::{DeoptState, FrameLayout, build_deopt_state};
pub use driver::{Landed, UnwindDriver};
pub use engine::UnwindEngine;
pub use error::{Result, UnwindError};
pub use frame::{FrameInfo, PythonFrame, Statement};
pub use generator::ReturnContext;
pub use hooks::RuntimeHooks;
pub use lsda::{Action, CallSiteEntry, Lsda};
pub use memory::{FrameMemory, NativeMemory};
pub use profile::ExceptionProfile;
pub use region::{CodeRegion, RegionTable, Tier};
pub use registers::RegisterFile;
pub use session::{ExcInfo, UnwindSession};
pub use stackmap::{StackMap, ValueLocation};
pub use stats::UnwindStats;
pub use traceback::{Traceback, TracebackEntry};
pub use walker::{FrameVisit, FrameWalker};
