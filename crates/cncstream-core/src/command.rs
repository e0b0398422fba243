//! G-Code command types and lifecycle management
//!
//! A [`GcodeCommand`] is created when it is queued, marked sent once it is
//! written to the firmware, and marked done exactly once when its
//! acknowledgment arrives. Once done, exactly one of ok / error / skipped
//! holds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Classification of one firmware line applied to a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseClass {
    /// `ok`, optionally followed by a sequence echo
    Ok,
    /// `error...`, carrying the text after the marker
    Error(String),
    /// Anything else; appended to the response without completing the command
    Verbose,
}

/// A single queued machining instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcodeCommand {
    command: String,
    original_command: String,
    comment: Option<String>,
    line_number: Option<u64>,
    sequence: u64,
    sent: bool,
    done: bool,
    ok: bool,
    error: bool,
    skipped: bool,
    response: String,
    error_message: Option<String>,
    sent_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl GcodeCommand {
    /// Create a command from its firmware-ready text, source text, comment and sequence number
    pub fn new(
        command: impl Into<String>,
        original_command: impl Into<String>,
        comment: Option<String>,
        sequence: u64,
    ) -> Self {
        Self {
            command: command.into(),
            original_command: original_command.into(),
            comment,
            line_number: None,
            sequence,
            sent: false,
            done: false,
            ok: false,
            error: false,
            skipped: false,
            response: String::new(),
            error_message: None,
            sent_at: None,
            completed_at: None,
        }
    }

    /// Create a command whose processed and original text are the same
    pub fn from_text(text: impl Into<String>, sequence: u64) -> Self {
        let text = text.into();
        Self::new(text.clone(), text, None, sequence)
    }

    /// Attach the source line number
    pub fn with_line_number(mut self, line_number: u64) -> Self {
        self.line_number = Some(line_number);
        self
    }

    /// Firmware-ready text, exactly what goes on the wire (without terminator)
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn original_command(&self) -> &str {
        &self.original_command
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn line_number(&self) -> Option<u64> {
        self.line_number
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Bytes this command occupies in the firmware RX buffer, terminator included
    pub fn buffer_cost(&self) -> usize {
        self.command.len() + 1
    }

    /// Commands with no firmware text keep their slot in history but never hit the wire
    pub fn is_skippable(&self) -> bool {
        self.command.trim().is_empty()
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// True once a terminal response (or a skip) has been applied
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped
    }

    /// Every line applied to this command, newline separated
    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.sent_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Mark this command as written to the firmware
    pub fn mark_sent(&mut self) {
        debug_assert!(
            !self.sent && !self.done,
            "mark_sent called on a command that was already sent or done"
        );
        self.sent = true;
        self.sent_at = Some(Utc::now());
    }

    /// Mark this command as skipped; it will never be written
    pub fn mark_skipped(&mut self) {
        debug_assert!(!self.sent, "mark_skipped called on a sent command");
        self.skipped = true;
        self.complete();
    }

    /// Fail this command without it ever reaching the firmware
    pub fn mark_rejected(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.error = true;
        self.append_response(&message);
        self.error_message = Some(message);
        self.complete();
    }

    /// Apply one firmware line to this command.
    ///
    /// Matching is case-insensitive: `ok` (with an optional sequence echo)
    /// completes it successfully, text starting with `error` completes it as
    /// failed with the remainder as the message, anything else is appended
    /// to the response as verbose output.
    pub fn apply_response(&mut self, text: &str) -> ResponseClass {
        let class = classify_response(text);
        self.apply_classified(text, class)
    }

    /// Apply a firmware line that has already been classified.
    ///
    /// Used for dialects whose acknowledgments are not plain `ok`/`error`
    /// text. A command that is already done keeps its outcome.
    pub fn apply_classified(&mut self, text: &str, class: ResponseClass) -> ResponseClass {
        self.append_response(text.trim());

        if self.done {
            return class;
        }

        match &class {
            ResponseClass::Ok => {
                self.ok = true;
                self.complete();
            }
            ResponseClass::Error(message) => {
                self.error = true;
                self.error_message = Some(message.clone());
                self.complete();
            }
            ResponseClass::Verbose => {}
        }
        class
    }

    fn append_response(&mut self, text: &str) {
        if !self.response.is_empty() {
            self.response.push('\n');
        }
        self.response.push_str(text);
    }

    fn complete(&mut self) {
        self.done = true;
        self.completed_at = Some(Utc::now());
    }
}

impl fmt::Display for GcodeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.sequence, self.command)
    }
}

/// Classify a firmware line as an acknowledgment, an error, or verbose output
pub fn classify_response(text: &str) -> ResponseClass {
    let trimmed = text.trim();
    let lower = trimmed.to_ascii_lowercase();

    if let Some(rest) = lower.strip_prefix("ok") {
        if is_sequence_echo(rest) {
            return ResponseClass::Ok;
        }
    }

    if lower.starts_with("error") {
        let message = trimmed["error".len()..]
            .trim_start_matches(|c: char| c == ':' || c.is_whitespace())
            .to_string();
        return ResponseClass::Error(message);
    }

    ResponseClass::Verbose
}

/// `""`, `":12"`, `" 12"`, `" N12"` all count as a sequence echo after `ok`
fn is_sequence_echo(rest: &str) -> bool {
    let echo = rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
    let echo = echo.strip_prefix('n').unwrap_or(echo);
    if rest.is_empty() {
        return true;
    }
    // "okay" or "ok_foo" are not acknowledgments
    let separated = rest.starts_with(':') || rest.starts_with(char::is_whitespace);
    separated && !echo.is_empty() && echo.chars().all(|c| c.is_ascii_digit())
}

/// Split a raw G-code line into code and comment.
///
/// Handles `;` line comments and `( ... )` block comments. Returns the code
/// with comments removed and trimmed, and the joined comment text if any.
pub fn split_comment(line: &str) -> (String, Option<String>) {
    let mut code = String::with_capacity(line.len());
    let mut comments: Vec<String> = Vec::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            ';' => {
                let rest: String = chars.by_ref().collect();
                comments.push(rest.trim().to_string());
            }
            '(' => {
                let mut block = String::new();
                for inner in chars.by_ref() {
                    if inner == ')' {
                        break;
                    }
                    block.push(inner);
                }
                comments.push(block.trim().to_string());
            }
            _ => code.push(c),
        }
    }

    comments.retain(|c| !c.is_empty());
    let comment = if comments.is_empty() {
        None
    } else {
        Some(comments.join(" "))
    };
    (code.trim().to_string(), comment)
}

/// Command numbering generator for sequential tracking
#[derive(Clone, Debug)]
pub struct CommandNumberGenerator {
    counter: Arc<AtomicU64>,
}

impl CommandNumberGenerator {
    /// Create a new command number generator
    pub fn new() -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get the next command number
    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Get current command count without incrementing
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Default for CommandNumberGenerator {
    fn default() -> Self {
        Self::new()
    }
}
