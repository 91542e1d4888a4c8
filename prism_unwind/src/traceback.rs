//! Traceback accumulation and formatting.

use std::fmt;
use std::sync::Arc;

use crate::frame::{FrameInfo, Statement};

/// One traceback line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracebackEntry {
    pub function_id: u64,
    pub name: Arc<str>,
    pub filename: Arc<str>,
    /// Source line, when the frame reported a statement.
    pub line: Option<u32>,
}

impl TracebackEntry {
    pub fn new(info: &FrameInfo, statement: Option<Statement>) -> Self {
        Self {
            function_id: info.function_id,
            name: Arc::clone(&info.name),
            filename: Arc::clone(&info.filename),
            line: statement.map(|s| s.line),
        }
    }
}

/// Entries in unwind order: innermost frame first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Traceback {
    entries: Vec<TracebackEntry>,
}

impl Traceback {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, entry: TracebackEntry) {
        self.entries.push(entry);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries innermost first.
    #[inline]
    pub fn entries(&self) -> &[TracebackEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Formats most recent call last.
impl fmt::Display for Traceback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Traceback (most recent call last):")?;
        for entry in self.entries.iter().rev() {
            match entry.line {
                Some(line) => writeln!(
                    f,
                    "  File \"{}\", line {}, in {}",
                    entry.filename, line, entry.name
                )?,
                None => writeln!(f, "  File \"{}\", in {}", entry.filename, entry.name)?,
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
