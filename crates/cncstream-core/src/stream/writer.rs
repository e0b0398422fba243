use super::{DEFAULT_HEADER_WIDTH, DELIMITER_CHAR, FIELD_DELIMITER, MAX_HEADER_WIDTH};
use crate::error::{Result, StreamError};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Appends records to a stream file and patches the row count on close
pub struct GcodeStreamWriter {
    out: BufWriter<File>,
    path: PathBuf,
    header_width: usize,
    rows: u64,
}

impl GcodeStreamWriter {
    /// Create (or truncate) a stream file with the default header width
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_header_width(path, DEFAULT_HEADER_WIDTH)
    }

    /// Create (or truncate) a stream file reserving `header_width` bytes for the row count
    pub fn with_header_width(path: impl AsRef<Path>, header_width: usize) -> Result<Self> {
        if header_width == 0 || header_width > MAX_HEADER_WIDTH {
            return Err(StreamError::InvalidHeaderWidth {
                width: header_width,
                max: MAX_HEADER_WIDTH,
            }
            .into());
        }

        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let mut out = BufWriter::new(file);
        out.write_all(" ".repeat(header_width).as_bytes())?;
        out.write_all(b"\n")?;

        tracing::debug!("Created stream file {}", path.display());
        Ok(Self {
            out,
            path,
            header_width,
            rows: 0,
        })
    }

    /// Append one record
    pub fn add_line(
        &mut self,
        processed: &str,
        original: &str,
        comment: &str,
        line_number: u64,
    ) -> Result<()> {
        check_field("processed", processed)?;
        check_field("original", original)?;
        check_field("comment", comment)?;

        writeln!(
            self.out,
            "{processed}{d}{original}{d}{comment}{d}{line_number}",
            d = FIELD_DELIMITER
        )?;
        self.rows += 1;
        Ok(())
    }

    /// Rows written so far
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush, then overwrite the reserved header with the final row count.
    ///
    /// Fails without touching the header when the count does not fit.
    pub fn close(mut self) -> Result<u64> {
        self.out.flush()?;

        let count = self.rows.to_string();
        if count.len() > self.header_width {
            tracing::error!(
                "Stream file {} has {} rows, which overflows its {} byte header",
                self.path.display(),
                self.rows,
                self.header_width
            );
            return Err(StreamError::HeaderOverflow {
                rows: self.rows,
                width: self.header_width,
            }
            .into());
        }

        let mut file = self.out.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(format!("{:<width$}", count, width = self.header_width).as_bytes())?;
        file.sync_all()?;

        tracing::debug!("Closed stream file {} ({} rows)", self.path.display(), self.rows);
        Ok(self.rows)
    }
}

fn check_field(field: &'static str, value: &str) -> Result<()> {
    if value.contains('\n') || value.contains('\r') {
        return Err(StreamError::EmbeddedNewline { field }.into());
    }
    // A lone marker next to a delimiter would shift the split on read
    if value.contains(DELIMITER_CHAR) {
        return Err(StreamError::EmbeddedDelimiter { field }.into());
    }
    Ok(())
}
