//! Character counting flow control
//!
//! The firmware's RX buffer silently drops or corrupts input on overrun,
//! so the sender keeps a ledger of every command written but not yet
//! acknowledged and never lets
//! `Σ (len(command) + 1)` over that ledger exceed the buffer size.

use cncstream_core::GcodeCommand;
use std::collections::VecDeque;

/// Sent-but-unacknowledged commands and their running byte total
#[derive(Debug)]
pub struct FlowControlLedger {
    buffer_size: usize,
    in_flight: VecDeque<GcodeCommand>,
    used: usize,
    single_step: bool,
}

impl FlowControlLedger {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            in_flight: VecDeque::new(),
            used: 0,
            single_step: false,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Bytes currently occupied in the firmware buffer
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    pub fn headroom(&self) -> usize {
        self.buffer_size.saturating_sub(self.used)
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn set_single_step(&mut self, enabled: bool) {
        self.single_step = enabled;
    }

    pub fn is_single_step(&self) -> bool {
        self.single_step
    }

    /// True if `candidate` may be written now.
    ///
    /// Empty commands are never sendable. A command that exactly fills the
    /// remaining headroom is.
    pub fn can_send(&self, candidate: &GcodeCommand) -> bool {
        if candidate.is_skippable() {
            return false;
        }
        if self.single_step && !self.in_flight.is_empty() {
            return false;
        }
        candidate.buffer_cost() <= self.headroom()
    }

    /// True if `candidate` could ever be sent, even with an empty buffer
    pub fn fits(&self, candidate: &GcodeCommand) -> bool {
        candidate.buffer_cost() <= self.buffer_size
    }

    /// Record a command as written
    pub fn record_sent(&mut self, command: GcodeCommand) {
        debug_assert!(self.can_send(&command), "ledger overrun: {}", command);
        self.used += command.buffer_cost();
        self.in_flight.push_back(command);
    }

    /// Oldest in-flight command, the one the next acknowledgment belongs to
    pub fn front_mut(&mut self) -> Option<&mut GcodeCommand> {
        self.in_flight.front_mut()
    }

    /// Remove the oldest in-flight command and release its bytes
    pub fn acknowledge(&mut self) -> Option<GcodeCommand> {
        let command = self.in_flight.pop_front()?;
        self.used -= command.buffer_cost();
        Some(command)
    }

    /// Snapshot of the in-flight commands, oldest first
    pub fn in_flight(&self) -> impl Iterator<Item = &GcodeCommand> {
        self.in_flight.iter()
    }

    /// Forget every in-flight command
    pub fn drain(&mut self) -> Vec<GcodeCommand> {
        self.used = 0;
        self.in_flight.drain(..).collect()
    }
}
