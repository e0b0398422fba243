//! Buffered communicator with character counting flow control
//!
//! Commands come from three places, in this priority order:
//! 1. a command that was taken earlier but did not fit yet
//! 2. the in-memory command queue
//! 3. the attached stream file
//!
//! Each command is written as `command + "\n"` only when the
//! [`FlowControlLedger`] says it fits. Acknowledgments are matched to the
//! oldest in-flight command. An error acknowledgment pauses sending until
//! [`BufferedCommunicator::resume_send`] is called.

use super::FlowControlLedger;
use crate::connection::Connection;
use crate::firmware::{FirmwareAdapter, ResponseKind};
use cncstream_core::{
    CommandNumberGenerator, ControllerEvent, EventDispatcher, GcodeCommand, GcodeStreamReader,
    MessageType, ResponseClass, Result,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Configuration for buffered communication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommunicatorConfig {
    /// Firmware RX buffer budget in bytes
    pub buffer_size: usize,
    /// Allow only one command in flight at a time
    pub single_step: bool,
}

impl CommunicatorConfig {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            single_step: false,
        }
    }
}

/// Progress counters for the current job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCounters {
    /// Rows in the job
    pub total: u64,
    /// Rows written to the firmware
    pub sent: u64,
    /// Rows completed without being written
    pub skipped: u64,
    /// Rows with a terminal response, skipped rows excluded
    pub completed: u64,
    /// Rows that completed with an error
    pub errors: u64,
}

/// What one call to [`BufferedCommunicator::stream_commands`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    pub sent: usize,
    pub skipped: usize,
    pub rejected: usize,
    /// The attached stream file could not be read and was dropped
    pub stream_failed: bool,
}

/// Result of handling one received line
#[derive(Debug, Clone)]
pub struct LineOutcome {
    /// How the firmware adapter classified the line
    pub kind: ResponseKind,
    /// The command this line completed, if it was an acknowledgment
    pub completed: Option<GcodeCommand>,
}

struct SendState {
    next: Option<GcodeCommand>,
    queue: VecDeque<GcodeCommand>,
    stream: Option<GcodeStreamReader>,
    ledger: FlowControlLedger,
    paused: bool,
    canceled: bool,
    counters: StreamCounters,
}

impl SendState {
    fn take_next(&mut self, sequence: &CommandNumberGenerator) -> Result<Option<GcodeCommand>> {
        if let Some(command) = self.next.take() {
            return Ok(Some(command));
        }
        if let Some(command) = self.queue.pop_front() {
            return Ok(Some(command));
        }
        let Some(reader) = self.stream.as_mut() else {
            return Ok(None);
        };
        match reader.next_record() {
            Ok(Some(record)) => Ok(Some(record.into_command(sequence.next()))),
            Ok(None) => {
                self.stream = None;
                Ok(None)
            }
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    fn rows_remaining(&self) -> u64 {
        self.queue.len() as u64
            + u64::from(self.next.is_some())
            + self.stream.as_ref().map_or(0, GcodeStreamReader::rows_remaining)
    }
}

enum Step {
    Send(GcodeCommand),
    Skip(GcodeCommand),
    Reject(GcodeCommand),
}

/// Streams commands to the firmware without overrunning its RX buffer
pub struct BufferedCommunicator {
    connection: Arc<dyn Connection>,
    adapter: Arc<dyn FirmwareAdapter>,
    events: EventDispatcher,
    sequence: CommandNumberGenerator,
    state: Mutex<SendState>,
    send_guard: Mutex<()>,
    ready: Arc<Notify>,
}

impl BufferedCommunicator {
    pub fn new(
        connection: Arc<dyn Connection>,
        adapter: Arc<dyn FirmwareAdapter>,
        events: EventDispatcher,
        sequence: CommandNumberGenerator,
        config: CommunicatorConfig,
    ) -> Self {
        let mut ledger = FlowControlLedger::new(config.buffer_size);
        ledger.set_single_step(config.single_step);
        Self {
            connection,
            adapter,
            events,
            sequence,
            state: Mutex::new(SendState {
                next: None,
                queue: VecDeque::new(),
                stream: None,
                ledger,
                paused: false,
                canceled: false,
                counters: StreamCounters::default(),
            }),
            send_guard: Mutex::new(()),
            ready: Arc::new(Notify::new()),
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn adapter(&self) -> &Arc<dyn FirmwareAdapter> {
        &self.adapter
    }

    /// Signalled whenever there may be something new to send
    pub fn ready_signal(&self) -> Arc<Notify> {
        self.ready.clone()
    }

    pub fn queue_command(&self, command: GcodeCommand) {
        self.queue_commands(std::iter::once(command));
    }

    pub fn queue_commands(&self, commands: impl IntoIterator<Item = GcodeCommand>) -> usize {
        let added = {
            let mut state = self.state.lock();
            let before = state.queue.len();
            state.queue.extend(commands);
            state.canceled = false;
            state.queue.len() - before
        };
        self.ready.notify_one();
        added
    }

    /// Attach a stream file; its rows are sent after the queue drains
    pub fn attach_stream(&self, reader: GcodeStreamReader) -> u64 {
        let rows = reader.rows_remaining();
        {
            let mut state = self.state.lock();
            state.stream = Some(reader);
            state.canceled = false;
        }
        self.ready.notify_one();
        rows
    }

    /// Hand a whole job over and reset the counters to its size
    pub fn begin_job(&self, commands: Vec<GcodeCommand>, stream: Option<GcodeStreamReader>) -> u64 {
        let total = {
            let mut state = self.state.lock();
            let total =
                commands.len() as u64 + stream.as_ref().map_or(0, GcodeStreamReader::rows_remaining);
            state.queue.extend(commands);
            if stream.is_some() {
                state.stream = stream;
            }
            state.canceled = false;
            state.counters = StreamCounters {
                total,
                ..StreamCounters::default()
            };
            total
        };
        self.ready.notify_one();
        total
    }

    /// Write as many commands as the firmware buffer allows.
    ///
    /// Stops when sending is paused, nothing is left, or the next command
    /// does not fit yet. Only transport write failures are returned as
    /// errors. A stream file that cannot be read is dropped, reported on the
    /// console and flagged in [`SendReport::stream_failed`].
    pub fn stream_commands(&self) -> Result<SendReport> {
        let _guard = self.send_guard.lock();
        let mut report = SendReport::default();
        let mut stream_error = None;

        loop {
            let step = {
                let mut state = self.state.lock();
                if state.paused {
                    break;
                }
                let mut command = match state.take_next(&self.sequence) {
                    Ok(Some(command)) => command,
                    Ok(None) => break,
                    Err(e) => {
                        stream_error = Some(e);
                        break;
                    }
                };

                if command.is_skippable() {
                    command.mark_skipped();
                    state.counters.skipped += 1;
                    Step::Skip(command)
                } else if !state.ledger.fits(&command) {
                    let message = format!(
                        "command needs {} bytes, firmware buffer holds {}",
                        command.buffer_cost(),
                        state.ledger.buffer_size()
                    );
                    command.mark_rejected(message);
                    state.counters.completed += 1;
                    state.counters.errors += 1;
                    state.paused = true;
                    Step::Reject(command)
                } else if state.ledger.can_send(&command) {
                    command.mark_sent();
                    state.ledger.record_sent(command.clone());
                    state.counters.sent += 1;
                    Step::Send(command)
                } else {
                    state.next = Some(command);
                    break;
                }
            };

            match step {
                Step::Send(command) => {
                    let mut line = String::with_capacity(command.buffer_cost());
                    line.push_str(command.command());
                    line.push('\n');
                    self.connection.write_all(line.as_bytes())?;
                    tracing::debug!("Sent {}", command);
                    self.events.publish(ControllerEvent::CommandSent(command));
                    report.sent += 1;
                }
                Step::Skip(command) => {
                    self.events.publish(ControllerEvent::CommandSkipped(command));
                    report.skipped += 1;
                }
                Step::Reject(command) => {
                    tracing::warn!(
                        "Rejected {}: {}",
                        command,
                        command.error_message().unwrap_or_default()
                    );
                    self.events
                        .publish(ControllerEvent::CommandComplete(command.clone()));
                    self.events.publish(ControllerEvent::PausedOnError(command));
                    report.rejected += 1;
                    break;
                }
            }
        }

        if let Some(e) = stream_error {
            tracing::error!("Stream file unreadable, dropping it: {}", e);
            self.events.publish(ControllerEvent::ConsoleMessage(
                MessageType::Error,
                format!("Stream file unreadable: {}", e),
            ));
            report.stream_failed = true;
        }
        Ok(report)
    }

    /// Route one received line.
    ///
    /// Acknowledgments complete the oldest in-flight command. Settings and
    /// messages are appended to its response without completing it. Status
    /// and alarm lines are left for the caller.
    pub fn handle_line(&self, line: &str) -> LineOutcome {
        self.events
            .publish(ControllerEvent::RawResponse(line.to_string()));

        let kind = self.adapter.classify(line);
        let completed = match &kind {
            ResponseKind::Ok => self.acknowledge(line, ResponseClass::Ok),
            ResponseKind::Error(message) => {
                self.acknowledge(line, ResponseClass::Error(message.clone()))
            }
            ResponseKind::Setting => {
                self.append_verbose(line);
                None
            }
            ResponseKind::Message => {
                self.append_verbose(line);
                self.events.publish(ControllerEvent::ConsoleMessage(
                    MessageType::Verbose,
                    line.to_string(),
                ));
                None
            }
            ResponseKind::Status | ResponseKind::Alarm { .. } => None,
        };

        LineOutcome { kind, completed }
    }

    fn acknowledge(&self, line: &str, class: ResponseClass) -> Option<GcodeCommand> {
        let failed = matches!(class, ResponseClass::Error(_));
        let command = {
            let mut state = self.state.lock();
            if let Some(front) = state.ledger.front_mut() {
                front.apply_classified(line, class);
            }
            let command = state.ledger.acknowledge();
            if command.is_some() {
                state.counters.completed += 1;
                if failed {
                    state.counters.errors += 1;
                    state.paused = true;
                }
            }
            command
        };

        let Some(command) = command else {
            tracing::debug!("Acknowledgment with nothing in flight: {}", line);
            self.events.publish(ControllerEvent::ConsoleMessage(
                MessageType::Verbose,
                format!("Unexpected response: {}", line),
            ));
            return None;
        };

        if failed {
            tracing::warn!(
                "{} failed: {}",
                command,
                command.error_message().unwrap_or_default()
            );
        }
        self.events
            .publish(ControllerEvent::CommandComplete(command.clone()));
        if failed {
            self.events
                .publish(ControllerEvent::PausedOnError(command.clone()));
        }
        self.ready.notify_one();
        Some(command)
    }

    fn append_verbose(&self, line: &str) {
        let mut state = self.state.lock();
        if let Some(front) = state.ledger.front_mut() {
            front.apply_classified(line, ResponseClass::Verbose);
        }
    }

    /// Stop taking new commands; in-flight commands still resolve
    pub fn pause_send(&self) {
        self.state.lock().paused = true;
    }

    pub fn resume_send(&self) {
        self.state.lock().paused = false;
        self.ready.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Drop every command that has not been written yet.
    ///
    /// Returns how many rows were discarded. In-flight commands stay in the
    /// ledger and resolve normally.
    pub fn cancel_send(&self) -> u64 {
        let mut state = self.state.lock();
        let discarded = state.rows_remaining();
        state.next = None;
        state.queue.clear();
        state.stream = None;
        state.canceled = true;
        discarded
    }

    pub fn is_canceled(&self) -> bool {
        self.state.lock().canceled
    }

    /// Leave the canceled and paused states once a cancel has settled
    pub fn clear_cancel(&self) {
        let mut state = self.state.lock();
        state.canceled = false;
        state.paused = false;
    }

    /// Forget everything, including in-flight commands, which are returned
    /// still marked not done
    pub fn reset_buffers(&self) -> Vec<GcodeCommand> {
        let mut state = self.state.lock();
        state.next = None;
        state.queue.clear();
        state.stream = None;
        state.paused = false;
        state.canceled = false;
        state.ledger.drain()
    }

    /// Write realtime bytes immediately, outside the flow-control ledger
    pub fn send_realtime(&self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.connection.write_all(bytes)?;
        tracing::debug!("Sent realtime {:02x?}", bytes);
        Ok(())
    }

    pub fn set_single_step(&self, enabled: bool) {
        self.state.lock().ledger.set_single_step(enabled);
        self.ready.notify_one();
    }

    pub fn is_single_step(&self) -> bool {
        self.state.lock().ledger.is_single_step()
    }

    /// Number of commands written but not acknowledged
    pub fn in_flight(&self) -> usize {
        self.state.lock().ledger.len()
    }

    pub fn in_flight_commands(&self) -> Vec<GcodeCommand> {
        self.state.lock().ledger.in_flight().cloned().collect()
    }

    /// Bytes currently counted against the firmware buffer
    pub fn used_bytes(&self) -> usize {
        self.state.lock().ledger.used_bytes()
    }

    pub fn buffer_size(&self) -> usize {
        self.state.lock().ledger.buffer_size()
    }

    /// Rows not yet written: the pending command, the queue and the stream
    pub fn rows_remaining(&self) -> u64 {
        self.state.lock().rows_remaining()
    }

    /// True when nothing is waiting and nothing is in flight
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.rows_remaining() == 0 && state.ledger.is_empty()
    }

    pub fn counters(&self) -> StreamCounters {
        self.state.lock().counters
    }

    /// Return the counters and start over from zero
    pub fn take_counters(&self) -> StreamCounters {
        std::mem::take(&mut self.state.lock().counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{MemoryConnection, MemoryPeer};
    use crate::firmware::GrblAdapter;
    use cncstream_core::{EventCategory, EventFilter};

    fn communicator(buffer_size: usize) -> (BufferedCommunicator, MemoryPeer, EventDispatcher) {
        let (conn, peer) = MemoryConnection::pair();
        let events = EventDispatcher::default();
        let comm = BufferedCommunicator::new(
            Arc::new(conn),
            Arc::new(GrblAdapter::new()),
            events.clone(),
            CommandNumberGenerator::new(),
            CommunicatorConfig::new(buffer_size),
        );
        (comm, peer, events)
    }

    fn cmd(text: &str, seq: u64) -> GcodeCommand {
        GcodeCommand::from_text(text, seq)
    }

    #[test]
    fn test_withholds_until_acknowledged() {
        let (comm, peer, _) = communicator(10);
        comm.queue_commands([cmd("G0 X1", 0), cmd("G0 Y1", 1)]);

        let report = comm.stream_commands().unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(peer.written_lines(), vec!["G0 X1".to_string()]);
        assert_eq!(comm.used_bytes(), 6);

        let outcome = comm.handle_line("ok");
        assert_eq!(outcome.completed.unwrap().sequence(), 0);
        comm.stream_commands().unwrap();
        assert_eq!(peer.written_lines(), vec!["G0 X1".to_string(), "G0 Y1".to_string()]);
    }

    #[test]
    fn test_error_pauses_sending() {
        let (comm, peer, events) = communicator(64);
        let paused = Arc::new(Mutex::new(Vec::new()));
        let seen = paused.clone();
        events.subscribe(EventFilter::Categories(vec![EventCategory::Command]), move |e| {
            if let ControllerEvent::PausedOnError(cmd) = e {
                seen.lock().push(cmd.sequence());
            }
        });

        comm.queue_commands([cmd("G99", 0), cmd("G0X1", 1)]);
        comm.set_single_step(true);
        comm.stream_commands().unwrap();

        let outcome = comm.handle_line("error:20");
        let failed = outcome.completed.unwrap();
        assert!(failed.is_error());
        assert_eq!(*paused.lock(), vec![0]);
        assert!(comm.is_paused());

        comm.stream_commands().unwrap();
        assert_eq!(peer.written_lines().len(), 1);

        comm.resume_send();
        comm.stream_commands().unwrap();
        assert_eq!(peer.written_lines(), vec!["G99".to_string(), "G0X1".to_string()]);
        assert_eq!(comm.counters().errors, 1);
    }

    #[test]
    fn test_skippable_and_oversize_commands() {
        let (comm, peer, _) = communicator(8);
        comm.queue_commands([cmd("", 0), cmd("G1X100Y100", 1), cmd("M3", 2)]);

        let report = comm.stream_commands().unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.sent, 0);
        assert!(peer.written_lines().is_empty());
        assert!(comm.is_paused());

        comm.resume_send();
        comm.stream_commands().unwrap();
        assert_eq!(peer.written_lines(), vec!["M3".to_string()]);
    }

    #[test]
    fn test_verbose_lines_join_front_response() {
        let (comm, _peer, _) = communicator(64);
        comm.queue_command(cmd("$$", 0));
        comm.stream_commands().unwrap();

        assert!(comm.handle_line("$0=10").completed.is_none());
        let done = comm.handle_line("ok").completed.unwrap();
        assert_eq!(done.response(), "$0=10\nok");
    }

    #[test]
    fn test_cancel_keeps_in_flight() {
        let (comm, peer, _) = communicator(16);
        comm.queue_commands((0..5).map(|i| cmd("G0X1", i)));
        comm.stream_commands().unwrap();
        assert_eq!(comm.in_flight(), 3);

        assert_eq!(comm.cancel_send(), 2);
        assert!(!comm.is_drained());
        for _ in 0..3 {
            comm.handle_line("ok");
        }
        comm.stream_commands().unwrap();
        assert!(comm.is_drained());
        assert_eq!(peer.written_lines().len(), 3);
    }

    #[test]
    fn test_unexpected_ok_is_harmless() {
        let (comm, _peer, _) = communicator(16);
        let outcome = comm.handle_line("ok");
        assert_eq!(outcome.kind, ResponseKind::Ok);
        assert!(outcome.completed.is_none());
        assert_eq!(comm.used_bytes(), 0);
    }

    #[test]
    fn test_corrupt_stream_is_not_a_write_failure() {
        use cncstream_core::stream::FIELD_DELIMITER;
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.gcs");
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "{:<20}", 3).unwrap();
            writeln!(file, "G0X1{d}G0 X1{d}{d}1", d = FIELD_DELIMITER).unwrap();
            writeln!(file, "G0X2{d}G0 X2{d}2", d = FIELD_DELIMITER).unwrap();
        }

        let (comm, peer, _) = communicator(64);
        comm.attach_stream(GcodeStreamReader::open(&path).unwrap());
        let report = comm.stream_commands().unwrap();
        assert_eq!(report.sent, 1);
        assert!(report.stream_failed);
        assert_eq!(peer.written_lines(), vec!["G0X1".to_string()]);
        assert_eq!(comm.rows_remaining(), 0);
        assert_eq!(comm.in_flight(), 1);
    }

    #[test]
    fn test_reset_returns_in_flight() {
        let (comm, _peer, _) = communicator(64);
        comm.queue_commands([cmd("G0X1", 0), cmd("G0X2", 1)]);
        comm.stream_commands().unwrap();

        let discarded = comm.reset_buffers();
        assert_eq!(discarded.len(), 2);
        assert!(discarded.iter().all(|c| !c.is_done()));
        assert!(comm.is_drained());
    }
}
