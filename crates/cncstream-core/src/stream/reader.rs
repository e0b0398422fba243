use super::{StreamRecord, FIELD_DELIMITER};
use crate::error::{Result, StreamError};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Reads a stream file one record at a time
///
/// The header is parsed on open, so the remaining row count is known
/// without scanning the file.
pub struct GcodeStreamReader {
    input: BufReader<File>,
    path: PathBuf,
    total_rows: u64,
    remaining: u64,
    line: String,
}

impl GcodeStreamReader {
    /// Open a stream file and parse its header
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut input = BufReader::new(File::open(&path)?);

        let mut header = String::new();
        let read = input
            .read_line(&mut header)
            .map_err(|e| StreamError::InvalidHeader {
                reason: e.to_string(),
            })?;
        if read == 0 {
            return Err(StreamError::InvalidHeader {
                reason: "file is empty".to_string(),
            }
            .into());
        }

        let total_rows = header
            .trim()
            .parse::<u64>()
            .map_err(|e| StreamError::InvalidHeader {
                reason: format!("'{}': {}", header.trim(), e),
            })?;

        tracing::debug!("Opened stream file {} ({} rows)", path.display(), total_rows);
        Ok(Self {
            input,
            path,
            total_rows,
            remaining: total_rows,
            line: String::new(),
        })
    }

    /// True while records remain
    pub fn ready(&self) -> bool {
        self.remaining > 0
    }

    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    pub fn rows_remaining(&self) -> u64 {
        self.remaining
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse exactly one record.
    ///
    /// Returns `Ok(None)` once the header's row count has been consumed.
    pub fn next_record(&mut self) -> Result<Option<StreamRecord>> {
        if !self.ready() {
            return Ok(None);
        }

        let row = self.total_rows - self.remaining;
        self.line.clear();
        // Anything unreadable in the file is a format fault, never a transport one
        let read = self
            .input
            .read_line(&mut self.line)
            .map_err(|e| StreamError::InvalidRecord {
                row,
                reason: e.to_string(),
            })?;
        if read == 0 {
            return Err(StreamError::Truncated {
                expected: self.total_rows,
                read: row,
            }
            .into());
        }
        self.remaining -= 1;

        let record = self.line.strip_suffix('\n').unwrap_or(&self.line);
        let fields: Vec<&str> = record.split(FIELD_DELIMITER).collect();
        if fields.len() != 4 {
            return Err(StreamError::FieldCount {
                row,
                found: fields.len(),
            }
            .into());
        }

        let line_number = fields[3]
            .parse::<u64>()
            .map_err(|e| StreamError::InvalidRecord {
                row,
                reason: format!("bad line number '{}': {}", fields[3], e),
            })?;

        Ok(Some(StreamRecord {
            processed: fields[0].to_string(),
            original: fields[1].to_string(),
            comment: fields[2].to_string(),
            line_number,
        }))
    }
}

impl std::fmt::Debug for GcodeStreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcodeStreamReader")
            .field("path", &self.path)
            .field("total_rows", &self.total_rows)
            .field("remaining", &self.remaining)
            .finish()
    }
}
