//! Line framing for the receive path

/// Longest partial line kept before it is flushed as a line of its own
pub const MAX_LINE_BYTES: usize = 4096;

/// Splits a byte stream into newline terminated lines.
///
/// `\r\n` and `\n` both terminate a line. Partial lines are kept until the
/// rest arrives, up to [`MAX_LINE_BYTES`]. Blank lines are dropped.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes, returning every line they complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                lines.extend(self.take_line());
                continue;
            }
            self.pending.push(byte);
            if self.pending.len() >= MAX_LINE_BYTES {
                tracing::warn!(
                    "No line terminator after {} bytes, flushing partial line",
                    MAX_LINE_BYTES
                );
                lines.extend(self.take_line());
            }
        }
        lines
    }

    fn take_line(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.pending);
        let raw = raw.strip_suffix(b"\r").unwrap_or(&raw);
        let line = String::from_utf8_lossy(raw).trim().to_string();
        (!line.is_empty()).then_some(line)
    }

    /// Bytes received since the last terminator
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_across_reads() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"o").is_empty());
        assert_eq!(framer.pending(), 1);
        assert_eq!(framer.push(b"k\r\nerror:2"), vec!["ok".to_string()]);
        assert_eq!(framer.push(b"0\n"), vec!["error:20".to_string()]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_runaway_line_is_flushed() {
        let mut framer = LineFramer::new();
        let noise = vec![b'x'; MAX_LINE_BYTES + 10];
        let lines = framer.push(&noise);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES);
        assert_eq!(framer.pending(), 10);

        assert_eq!(framer.push(b"\nok\n"), vec!["x".repeat(10), "ok".to_string()]);
    }

    #[test]
    fn test_blank_lines_dropped() {
        let mut framer = LineFramer::new();
        assert_eq!(
            framer.push(b"\r\n\nok\n  \n<Idle|MPos:0.000,0.000,0.000>\n"),
            vec!["ok".to_string(), "<Idle|MPos:0.000,0.000,0.000>".to_string()]
        );
    }
}
