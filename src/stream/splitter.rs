//! Line framing for the completions event stream.
//!
//! The backend writes one event per line as `data: <json>\n`. The splitter
//! keeps a carry buffer of text that has not seen its line terminator yet and
//! emits only complete `data: ` lines. Blank keep-alive lines, `:` comments
//! and any other field lines are dropped here without inspecting payloads.
use memchr::memchr_iter;
use smallvec::SmallVec;

use crate::error::StreamError;

/// Prefix that marks a line as an event frame.
pub const DATA_PREFIX: &str = "data: ";

const COMPACT_THRESHOLD_BYTES: usize = 8 * 1024;

/// A complete, newline-terminated `data: ` line (terminator removed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    line: String,
}

impl Frame {
    /// Build a frame from a single line without its terminator.
    ///
    /// Returns `None` when the line is not a data frame.
    #[must_use]
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with(DATA_PREFIX) {
            Some(Self {
                line: line.to_owned(),
            })
        } else {
            None
        }
    }

    /// Text after the `data: ` prefix.
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.line[DATA_PREFIX.len()..]
    }

    /// The full line, prefix included.
    #[must_use]
    pub fn line(&self) -> &str {
        &self.line
    }
}

/// Frames produced by one [`LineSplitter::push`] call, in arrival order.
pub type FrameBatch = SmallVec<[Frame; 4]>;

/// Incremental line splitter over decoded text.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: String,
    read_offset: usize,
    ignored_lines: usize,
}

impl LineSplitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `text` to the carry buffer and return every completed data frame.
    pub fn push(&mut self, text: &str) -> FrameBatch {
        let mut out = FrameBatch::new();
        self.push_into(text, &mut out);
        out
    }

    /// Same as [`Self::push`] but appends into a caller-provided batch.
    pub fn push_into(&mut self, text: &str, out: &mut FrameBatch) {
        if text.is_empty() {
            return;
        }
        let scan_start = self.buffer.len();
        self.buffer.push_str(text);
        let mut processed_up_to = self.read_offset;
        let bytes = self.buffer.as_bytes();
        for rel_pos in memchr_iter(b'\n', &bytes[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let line = &self.buffer[processed_up_to..line_end];
            match Frame::from_line(line) {
                Some(frame) => out.push(frame),
                None => {
                    let line = line.strip_suffix('\r').unwrap_or(line);
                    if !line.is_empty() && !line.starts_with(':') {
                        tracing::debug!(line_len = line.len(), "ignoring non-data stream line");
                    }
                    self.ignored_lines += 1;
                }
            }
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2
                || self.read_offset >= COMPACT_THRESHOLD_BYTES);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Text received after the last line terminator.
    #[must_use]
    pub fn carry(&self) -> &str {
        &self.buffer[self.read_offset..]
    }

    /// Number of complete lines that were not data frames.
    #[must_use]
    pub fn ignored_lines(&self) -> usize {
        self.ignored_lines
    }

    /// Drop the carry buffer at end of stream.
    ///
    /// An unterminated tail is never treated as a frame.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::TruncatedFrame`] when non-blank text was still
    /// waiting for its line terminator.
    pub fn finish(&mut self) -> Result<(), StreamError> {
        let tail_len = self.carry().trim().len();
        let bytes = self.carry().len();
        self.buffer.clear();
        self.read_offset = 0;
        if tail_len == 0 {
            Ok(())
        } else {
            Err(StreamError::TruncatedFrame { bytes })
        }
    }
}
