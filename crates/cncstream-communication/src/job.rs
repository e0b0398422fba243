//! Job preparation
//!
//! Converts a G-code source file into a stream file once, up front, so the
//! send loop only ever reads firmware-ready rows.

use crate::firmware::FirmwareAdapter;
use cncstream_core::{split_comment, GcodeStreamWriter, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Translate `source` into a stream file at `dest` and return its row count.
///
/// Every source line becomes one row, including comment-only lines, which
/// end up with empty firmware text and are skipped when streamed.
pub fn prepare_job(
    source: impl AsRef<Path>,
    dest: impl AsRef<Path>,
    adapter: &dyn FirmwareAdapter,
    header_width: usize,
) -> Result<u64> {
    let source = source.as_ref();
    let input = BufReader::new(File::open(source)?);
    let mut writer = GcodeStreamWriter::with_header_width(dest, header_width)?;

    for (index, line) in input.lines().enumerate() {
        let line = line?;
        let original = line.trim();
        let (code, comment) = split_comment(original);
        let processed = adapter.build_command(&code);
        writer.add_line(
            &processed,
            original,
            comment.as_deref().unwrap_or_default(),
            index as u64 + 1,
        )?;
    }

    let rows = writer.close()?;
    tracing::info!("Prepared {} rows from {}", rows, source.display());
    Ok(rows)
}
