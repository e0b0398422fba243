//! Bounded-memory job persistence
//!
//! A stream file lets a job with millions of commands be streamed without
//! holding it (or its firmware-ready translation) in memory.
//!
//! Layout:
//! - A fixed-width, space padded, newline terminated header holding the
//!   decimal row count. It is reserved when the file is created and
//!   rewritten in place when the writer is closed.
//! - One record per line:
//!   `processed<DELIM>original<DELIM>comment<DELIM>line_number\n`

mod reader;
mod writer;

pub use reader::GcodeStreamReader;
pub use writer::GcodeStreamWriter;

use crate::command::GcodeCommand;

/// Character the field delimiter is made of; no field may contain it
pub const DELIMITER_CHAR: char = '\u{00B6}';

/// Separates the four fields of a record
pub const FIELD_DELIMITER: &str = "\u{00B6}\u{00B6}";

/// Header width used when none is given
pub const DEFAULT_HEADER_WIDTH: usize = 20;

/// Widest header a writer will reserve
pub const MAX_HEADER_WIDTH: usize = 32;

/// One record of a stream file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    /// Firmware-ready command text
    pub processed: String,
    /// Command text as it appeared in the source
    pub original: String,
    /// Comment stripped from the source line (empty if none)
    pub comment: String,
    /// Line number in the source file
    pub line_number: u64,
}

impl StreamRecord {
    /// Turn the record into a queued command with the given sequence number
    pub fn into_command(self, sequence: u64) -> GcodeCommand {
        let comment = if self.comment.is_empty() {
            None
        } else {
            Some(self.comment)
        };
        GcodeCommand::new(self.processed, self.original, comment, sequence)
            .with_line_number(self.line_number)
    }
}
