//! Controller state machine
//!
//! A [`Controller`] owns one firmware session at a time. Connecting starts
//! three workers:
//! - a reader thread that frames received bytes into lines and routes them
//! - a producer task that writes commands whenever the firmware has room
//! - an optional status poller
//!
//! Controller state is derived from status reports, alarms and stream
//! lifecycle. `Alarm` is sticky and only [`Controller::unlock`] leaves it.
//! Any transport failure discards in-flight commands and moves to
//! `Disconnected`.

pub mod poller;
pub mod query;

pub use poller::{PollTracker, StatusPoller};

use crate::communicator::{
    BufferedCommunicator, CommunicatorConfig, LineFramer, LineOutcome, StreamCounters,
};
use crate::connection::Connection;
use crate::firmware::{FirmwareAdapter, ResponseKind};
use cncstream_core::{
    split_comment, CommandNumberGenerator, ControllerError, ControllerEvent, ControllerState,
    ControllerStatus, Error, EventDispatcher, FirmwareError, GcodeCommand, GcodeStreamReader,
    MessageType, Result,
};
use parking_lot::{Mutex, RwLock};
use query::ActiveQuery;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

const READ_CHUNK: usize = 512;

/// Tunables for a [`Controller`]
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Overrides the firmware adapter's RX buffer size
    pub buffer_size: Option<usize>,
    /// Status request period; zero disables polling
    pub status_poll_interval: Duration,
    /// Default timeout for queries and awaited commands
    pub query_timeout: Duration,
    /// How long a cancel waits for in-flight commands before forcing a reset
    pub cancel_timeout: Duration,
    /// Allow only one command in flight at a time
    pub single_step: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            buffer_size: None,
            status_poll_interval: Duration::from_millis(200),
            query_timeout: Duration::from_secs(2),
            cancel_timeout: Duration::from_secs(5),
            single_step: false,
        }
    }
}

struct ControllerCore {
    state: ControllerState,
    status: Arc<ControllerStatus>,
    streaming: bool,
    canceling: bool,
    /// Code and description of the alarm that is holding the controller
    alarm: Option<(Option<u32>, String)>,
    pending_commands: Vec<GcodeCommand>,
    pending_stream: Option<GcodeStreamReader>,
}

type Transition = Option<(ControllerState, ControllerState)>;

struct Session {
    id: u64,
    communicator: Arc<BufferedCommunicator>,
    polls: Arc<PollTracker>,
    _shutdown: watch::Sender<bool>,
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.communicator.connection().close() {
            tracing::debug!("Error closing connection: {}", e);
        }
    }
}

struct Shared {
    adapter: Arc<dyn FirmwareAdapter>,
    options: ControllerOptions,
    events: EventDispatcher,
    sequence: CommandNumberGenerator,
    core: RwLock<ControllerCore>,
    session: RwLock<Option<Arc<Session>>>,
    state_tx: watch::Sender<ControllerState>,
    streaming_tx: watch::Sender<bool>,
    waiters: Mutex<HashMap<u64, oneshot::Sender<GcodeCommand>>>,
    query: Mutex<Option<ActiveQuery>>,
    single_step: AtomicBool,
    next_session: AtomicU64,
}

/// Drives one CNC controller through a firmware adapter
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    pub fn new(adapter: Arc<dyn FirmwareAdapter>, options: ControllerOptions) -> Self {
        let (state_tx, _) = watch::channel(ControllerState::Disconnected);
        let (streaming_tx, _) = watch::channel(false);
        let single_step = AtomicBool::new(options.single_step);
        Self {
            shared: Arc::new(Shared {
                adapter,
                options,
                events: EventDispatcher::default(),
                sequence: CommandNumberGenerator::new(),
                core: RwLock::new(ControllerCore {
                    state: ControllerState::Disconnected,
                    status: Arc::new(ControllerStatus::disconnected()),
                    streaming: false,
                    canceling: false,
                    alarm: None,
                    pending_commands: Vec::new(),
                    pending_stream: None,
                }),
                session: RwLock::new(None),
                state_tx,
                streaming_tx,
                waiters: Mutex::new(HashMap::new()),
                query: Mutex::new(None),
                single_step,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Event dispatcher; subscribe before connecting to see every event
    pub fn events(&self) -> &EventDispatcher {
        &self.shared.events
    }

    pub fn adapter(&self) -> &Arc<dyn FirmwareAdapter> {
        &self.shared.adapter
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.shared.options
    }

    /// Open a session over `connection`.
    ///
    /// Must be called from within a Tokio runtime. The state stays
    /// `Disconnected` until the firmware sends its first line.
    pub fn connect(&self, connection: Arc<dyn Connection>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::other(format!("connect needs a Tokio runtime: {}", e)))?;
        let shared = &self.shared;

        let buffer_size = shared
            .options
            .buffer_size
            .unwrap_or_else(|| shared.adapter.buffer_size());
        let config = CommunicatorConfig {
            buffer_size,
            single_step: shared.single_step.load(Ordering::SeqCst),
        };
        let communicator = Arc::new(BufferedCommunicator::new(
            connection.clone(),
            shared.adapter.clone(),
            shared.events.clone(),
            shared.sequence.clone(),
            config,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let id = shared.next_session.fetch_add(1, Ordering::SeqCst);
        let polls = Arc::new(PollTracker::default());

        {
            let mut slot = shared.session.write();
            if slot.is_some() {
                return Err(ControllerError::InvalidState {
                    operation: "connect".to_string(),
                    state: "already connected".to_string(),
                }
                .into());
            }
            *slot = Some(Arc::new(Session {
                id,
                communicator: communicator.clone(),
                polls: polls.clone(),
                _shutdown: shutdown_tx,
            }));
        }

        tracing::info!(
            "Connected to {} ({}, {} byte buffer)",
            connection.name(),
            shared.adapter.controller_type(),
            buffer_size
        );
        shared.events.publish(ControllerEvent::Connected {
            port: connection.name().to_string(),
            firmware: shared.adapter.controller_type().to_string(),
        });

        let reader = {
            let weak = Arc::downgrade(shared);
            let shutdown = shutdown_rx.clone();
            std::thread::Builder::new()
                .name("cncstream-reader".to_string())
                .spawn(move || run_reader(weak, id, connection, shutdown))
        };
        if let Err(e) = reader {
            shared.end_session(id, &format!("failed to start reader: {}", e));
            return Err(e.into());
        }

        runtime.spawn(run_producer(
            Arc::downgrade(shared),
            id,
            communicator.clone(),
            shutdown_rx.clone(),
        ));

        if !shared.options.status_poll_interval.is_zero() {
            let poller = StatusPoller::new(
                communicator,
                polls,
                shared.options.status_poll_interval,
            );
            runtime.spawn(poller.run(shutdown_rx));
        }

        Ok(())
    }

    /// Close the session, discarding anything still in flight
    pub fn disconnect(&self) -> Result<()> {
        let id = match self.shared.session.read().as_ref() {
            Some(session) => session.id,
            None => return Ok(()),
        };
        self.shared.end_session(id, "closed by user");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.session.read().is_some()
    }

    pub fn state(&self) -> ControllerState {
        self.shared.core.read().state
    }

    /// Latest status snapshot
    pub fn status(&self) -> Arc<ControllerStatus> {
        self.shared.core.read().status.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.core.read().streaming
    }

    /// True while sending is paused, by request or after an error
    pub fn is_paused(&self) -> bool {
        self.shared
            .current_session()
            .is_some_and(|s| s.communicator.is_paused())
    }

    /// Progress of the current job
    pub fn counters(&self) -> StreamCounters {
        self.shared
            .current_session()
            .map(|s| s.communicator.counters())
            .unwrap_or_default()
    }

    /// Commands written but not yet acknowledged
    pub fn in_flight(&self) -> Vec<GcodeCommand> {
        self.shared
            .current_session()
            .map(|s| s.communicator.in_flight_commands())
            .unwrap_or_default()
    }

    /// Rows not yet written, job rows waiting for `start_streaming` included
    pub fn rows_remaining(&self) -> u64 {
        let pending = {
            let core = self.shared.core.read();
            core.pending_commands.len() as u64
                + core
                    .pending_stream
                    .as_ref()
                    .map_or(0, GcodeStreamReader::rows_remaining)
        };
        pending
            + self
                .shared
                .current_session()
                .map_or(0, |s| s.communicator.rows_remaining())
    }

    pub fn set_single_step(&self, enabled: bool) {
        self.shared.single_step.store(enabled, Ordering::SeqCst);
        if let Some(session) = self.shared.current_session() {
            session.communicator.set_single_step(enabled);
        }
    }

    /// Build a command from source text
    pub fn create_command(&self, text: &str) -> GcodeCommand {
        self.shared.create_command(text)
    }

    /// Send one command right away.
    ///
    /// Not allowed while a job is streaming.
    pub fn send_command(&self, text: &str) -> Result<GcodeCommand> {
        let session = self.shared.require_session()?;
        let command = self.shared.create_command(text);
        self.shared.submit(&session, command.clone())?;
        Ok(command)
    }

    /// Send one command and wait for its terminal response
    pub async fn execute(&self, text: &str, timeout: Duration) -> Result<GcodeCommand> {
        let session = self.shared.require_session()?;
        let mut command = self.shared.create_command(text);

        if command.is_skippable() {
            command.mark_skipped();
            return Ok(command);
        }
        if command.buffer_cost() > session.communicator.buffer_size() {
            return Err(ControllerError::CommandRejected {
                reason: format!(
                    "{} needs {} bytes, firmware buffer holds {}",
                    command,
                    command.buffer_cost(),
                    session.communicator.buffer_size()
                ),
            }
            .into());
        }

        let sequence = command.sequence();
        let (tx, rx) = oneshot::channel();
        self.shared.waiters.lock().insert(sequence, tx);
        if let Err(e) = self.shared.submit(&session, command) {
            self.shared.waiters.lock().remove(&sequence);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(done)) => Ok(done),
            // Dropped by a reset while the session lives on
            Ok(Err(_)) if self.is_connected() => Err(ControllerError::Canceled.into()),
            Ok(Err(_)) => Err(ControllerError::NotConnected.into()),
            Err(_) => {
                self.shared.waiters.lock().remove(&sequence);
                Err(ControllerError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }

    /// Add one line to the job, held until [`Controller::start_streaming`]
    pub fn queue_command(&self, text: &str) -> GcodeCommand {
        let command = self.shared.create_command(text);
        self.shared.core.write().pending_commands.push(command.clone());
        command
    }

    /// Attach a prepared stream file to the job
    pub fn queue_stream(&self, reader: GcodeStreamReader) -> u64 {
        let rows = reader.rows_remaining();
        let replaced = self.shared.core.write().pending_stream.replace(reader);
        if let Some(old) = replaced {
            tracing::warn!("Replacing queued stream {}", old.path().display());
        }
        tracing::info!("Stream ready: {} rows", rows);
        self.shared
            .events
            .publish(ControllerEvent::PostProcessData(rows));
        rows
    }

    /// Drop the job rows that have not been started
    pub fn clear_job(&self) {
        let mut core = self.shared.core.write();
        core.pending_commands.clear();
        core.pending_stream = None;
    }

    /// Start sending the queued job
    pub fn start_streaming(&self) -> Result<()> {
        let session = self.shared.require_session()?;
        let (total, change) = {
            let mut core = self.shared.core.write();
            if core.streaming {
                return Err(ControllerError::AlreadyStreaming.into());
            }
            let stream_rows = core
                .pending_stream
                .as_ref()
                .map_or(0, GcodeStreamReader::rows_remaining);
            if core.pending_commands.is_empty() && stream_rows == 0 {
                return Err(ControllerError::NothingToStream.into());
            }
            if core.state == ControllerState::Alarm {
                let (code, message) = core.alarm.clone().unwrap_or_default();
                return Err(ControllerError::Alarm { code, message }.into());
            }
            if !core.state.is_ready() {
                return Err(ControllerError::InvalidState {
                    operation: "start streaming".to_string(),
                    state: core.state.to_string(),
                }
                .into());
            }
            if !session.communicator.is_drained() {
                return Err(ControllerError::InvalidState {
                    operation: "start streaming".to_string(),
                    state: "waiting for commands in flight".to_string(),
                }
                .into());
            }

            let commands = std::mem::take(&mut core.pending_commands);
            let stream = core.pending_stream.take();
            core.streaming = true;
            core.canceling = false;
            self.shared.streaming_tx.send_replace(true);
            let total = session.communicator.begin_job(commands, stream);
            let change = self.shared.transition(&mut core, ControllerState::Run);
            (total, change)
        };

        tracing::info!("Streaming {} rows", total);
        self.shared.announce(change);
        self.shared.console_info(format!("Streaming {} rows", total));
        Ok(())
    }

    /// Feed hold the machine and stop sending
    pub fn pause_stream(&self) -> Result<()> {
        let session = self.shared.require_session()?;
        if !self.is_streaming() {
            return Err(self.shared.invalid_state("pause"));
        }
        session.communicator.pause_send();
        self.shared
            .write_realtime(&session, self.shared.adapter.pause_bytes())?;
        self.shared.set_state(ControllerState::Hold);
        self.shared.console_info("Stream paused");
        Ok(())
    }

    /// Continue after a pause or an error
    pub fn resume_stream(&self) -> Result<()> {
        let session = self.shared.require_session()?;
        let streaming = self.is_streaming();
        if !streaming && !session.communicator.is_paused() {
            return Err(self.shared.invalid_state("resume"));
        }

        let state = self.state();
        if matches!(state, ControllerState::Hold | ControllerState::Door) {
            self.shared
                .write_realtime(&session, self.shared.adapter.resume_bytes())?;
            if streaming {
                self.shared.set_state(ControllerState::Run);
            }
        }
        session.communicator.resume_send();
        self.shared.console_info("Stream resumed");
        Ok(())
    }

    /// Cancel the running job.
    ///
    /// Unsent rows are dropped at once and the firmware is told to hold.
    /// Rows already in flight resolve on their own; when the last one
    /// does, the firmware's post-cancel sequence is written and the stream
    /// ends as canceled. If they do not resolve within the cancel timeout
    /// the firmware is reset and they are discarded.
    pub async fn cancel_stream(&self) -> Result<()> {
        let session = self.shared.require_session()?;
        {
            let mut core = self.shared.core.write();
            if !core.streaming {
                core.pending_commands.clear();
                core.pending_stream = None;
                return Ok(());
            }
            core.canceling = true;
        }

        let discarded = session.communicator.cancel_send();
        tracing::info!("Canceling stream, {} unsent rows dropped", discarded);
        self.shared.console_info(format!(
            "Canceling stream, {} unsent rows dropped",
            discarded
        ));
        self.shared
            .write_realtime(&session, self.shared.adapter.cancel_bytes())?;
        self.shared.finish_stream(&session, false);

        if self
            .wait_for_stream_end(self.shared.options.cancel_timeout)
            .await
            .is_err()
        {
            let stuck = session.communicator.reset_buffers();
            tracing::warn!(
                "{} commands did not resolve after cancel, resetting firmware",
                stuck.len()
            );
            self.shared.drop_waiters(&stuck);
            self.shared
                .write_realtime(&session, self.shared.adapter.reset_bytes())?;
            self.shared.finish_stream(&session, true);
        }
        Ok(())
    }

    /// Clear an alarm.
    ///
    /// Everything queued or in flight is discarded, then the firmware's
    /// unlock command is sent. The state returns to `Idle` once the firmware
    /// accepts it.
    pub async fn unlock(&self) -> Result<()> {
        let session = self.shared.require_session()?;
        let discarded = session.communicator.reset_buffers();
        if !discarded.is_empty() {
            tracing::warn!("Unlock discarded {} in-flight commands", discarded.len());
        }
        self.shared.drop_waiters(&discarded);
        self.shared.mark_canceling();
        self.shared.finish_stream(&session, true);

        let command = self
            .execute(
                self.shared.adapter.unlock_command(),
                self.shared.options.query_timeout,
            )
            .await?;
        if command.is_error() {
            return Err(ControllerError::CommandRejected {
                reason: command.error_message().unwrap_or_default().to_string(),
            }
            .into());
        }

        tracing::info!("Alarm cleared");
        self.shared.core.write().alarm = None;
        self.shared.set_state(ControllerState::Idle);
        Ok(())
    }

    /// Soft reset the firmware, discarding everything queued or in flight
    pub fn soft_reset(&self) -> Result<()> {
        let session = self.shared.require_session()?;
        let discarded = session.communicator.reset_buffers();
        self.shared.drop_waiters(&discarded);
        self.shared
            .write_realtime(&session, self.shared.adapter.reset_bytes())?;
        tracing::info!("Soft reset, {} in-flight commands discarded", discarded.len());
        self.shared.mark_canceling();
        self.shared.finish_stream(&session, true);
        Ok(())
    }

    /// Wait until the state satisfies `predicate`
    pub async fn wait_for_state<F>(&self, timeout: Duration, mut predicate: F) -> Result<ControllerState>
    where
        F: FnMut(ControllerState) -> bool,
    {
        let mut states = self.shared.state_tx.subscribe();
        let result = match tokio::time::timeout(timeout, states.wait_for(|s| predicate(*s))).await {
            Ok(Ok(state)) => Ok(*state),
            Ok(Err(_)) => Err(ControllerError::NotConnected.into()),
            Err(_) => Err(ControllerError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }
            .into()),
        };
        result
    }

    /// Wait until the firmware has answered and the controller left `Disconnected`
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<ControllerState> {
        self.wait_for_state(timeout, |s| s.is_connected()).await
    }

    /// Wait until no job is streaming
    pub async fn wait_for_stream_end(&self, timeout: Duration) -> Result<()> {
        let mut streaming = self.shared.streaming_tx.subscribe();
        let result = match tokio::time::timeout(timeout, streaming.wait_for(|s| !*s)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(ControllerError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }
            .into()),
        };
        result
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("adapter", &self.shared.adapter)
            .field("state", &self.state())
            .field("streaming", &self.is_streaming())
            .finish()
    }
}

impl Shared {
    fn current_session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    fn session_for(&self, id: u64) -> Option<Arc<Session>> {
        self.session.read().as_ref().filter(|s| s.id == id).cloned()
    }

    fn require_session(&self) -> Result<Arc<Session>> {
        self.current_session()
            .ok_or_else(|| ControllerError::NotConnected.into())
    }

    fn invalid_state(&self, operation: &str) -> Error {
        ControllerError::InvalidState {
            operation: operation.to_string(),
            state: self.core.read().state.to_string(),
        }
        .into()
    }

    fn create_command(&self, text: &str) -> GcodeCommand {
        let (_, comment) = split_comment(text);
        GcodeCommand::new(
            self.adapter.build_command(text),
            text.trim(),
            comment,
            self.sequence.next(),
        )
    }

    fn submit(&self, session: &Session, command: GcodeCommand) -> Result<()> {
        if self.core.read().streaming {
            return Err(ControllerError::InvalidState {
                operation: "send a command".to_string(),
                state: "streaming".to_string(),
            }
            .into());
        }
        session.communicator.queue_command(command);
        Ok(())
    }

    fn write_realtime(&self, session: &Session, bytes: &[u8]) -> Result<()> {
        if let Err(e) = session.communicator.send_realtime(bytes) {
            self.connection_lost(session.id, &e.to_string());
            return Err(e);
        }
        Ok(())
    }

    fn console_info(&self, text: impl Into<String>) {
        self.events
            .publish(ControllerEvent::ConsoleMessage(MessageType::Info, text.into()));
    }

    /// Fail the `execute` calls waiting on commands that were thrown away
    fn drop_waiters(&self, discarded: &[GcodeCommand]) {
        let mut waiters = self.waiters.lock();
        for command in discarded {
            waiters.remove(&command.sequence());
        }
    }

    /// Move `core` to `to` if the state machine allows it.
    ///
    /// Must be called with the core lock held; the returned change is
    /// published with [`Shared::announce`] after the lock is released.
    fn transition(&self, core: &mut ControllerCore, to: ControllerState) -> Transition {
        let from = core.state;
        if from == to {
            return None;
        }
        if !from.can_transition_to(to) {
            tracing::debug!("Ignoring state change {} -> {}", from, to);
            return None;
        }
        core.state = to;
        self.state_tx.send_replace(to);
        Some((from, to))
    }

    fn announce(&self, change: Transition) {
        if let Some((from, to)) = change {
            tracing::info!("State {} -> {}", from, to);
            self.events
                .publish(ControllerEvent::StateChanged { from, to });
        }
    }

    fn set_state(&self, to: ControllerState) -> bool {
        let change = {
            let mut core = self.core.write();
            self.transition(&mut core, to)
        };
        let changed = change.is_some();
        self.announce(change);
        changed
    }

    fn mark_canceling(&self) {
        let mut core = self.core.write();
        if core.streaming {
            core.canceling = true;
        }
    }

    /// End the stream once nothing is left, or right away when forced.
    ///
    /// Forced ends are used after the firmware was reset, so the
    /// post-cancel sequence is not written again.
    fn finish_stream(&self, session: &Session, force: bool) {
        let (canceled, counters, alarmed, change) = {
            let mut core = self.core.write();
            if !core.streaming || (!force && !session.communicator.is_drained()) {
                return;
            }
            core.streaming = false;
            let canceled = std::mem::take(&mut core.canceling);
            let counters = session.communicator.take_counters();
            session.communicator.clear_cancel();
            let alarmed = core.state == ControllerState::Alarm;
            let change = if alarmed {
                None
            } else {
                self.transition(&mut core, ControllerState::Idle)
            };
            self.streaming_tx.send_replace(false);
            (canceled, counters, alarmed, change)
        };

        if canceled {
            if !force && !alarmed {
                if let Err(e) = self.write_realtime(session, self.adapter.after_cancel_bytes()) {
                    tracing::warn!("Post-cancel sequence not written: {}", e);
                }
            }
            tracing::info!(
                "Stream canceled after {} of {} rows",
                counters.sent,
                counters.total
            );
            self.events.publish(ControllerEvent::StreamCanceled {
                sent: counters.sent,
                total: counters.total,
            });
        } else {
            let success = counters.errors == 0;
            tracing::info!(
                "Stream complete: {} of {} rows sent, {} errors",
                counters.sent,
                counters.total,
                counters.errors
            );
            self.events.publish(ControllerEvent::StreamComplete {
                sent: counters.sent,
                total: counters.total,
                success,
            });
        }
        self.announce(change);
    }

    /// Resume automatically after a failed manual command with nothing
    /// queued behind it, then check whether the stream is over
    fn settle(&self, session: &Session) {
        let streaming = self.core.read().streaming;
        let communicator = &session.communicator;
        if !streaming
            && communicator.is_paused()
            && communicator.rows_remaining() == 0
        {
            communicator.resume_send();
        }
        self.finish_stream(session, false);
    }

    fn pump(&self, session_id: u64, communicator: &BufferedCommunicator) {
        let Some(session) = self.session_for(session_id) else {
            return;
        };
        match communicator.stream_commands() {
            Ok(report) if report.stream_failed => self.abandon_stream(&session),
            Ok(report) if report.rejected > 0 => self.hold_after_error(&session),
            Ok(_) => {}
            Err(e) => {
                self.connection_lost(session_id, &e.to_string());
                return;
            }
        }
        self.settle(&session);
    }

    /// Cancel a job whose stream file turned out to be unreadable. The
    /// session is healthy, so in-flight commands resolve as usual.
    fn abandon_stream(&self, session: &Session) {
        if !self.core.read().streaming {
            return;
        }
        self.mark_canceling();
        let dropped = session.communicator.cancel_send();
        tracing::warn!("Canceling stream, {} queued rows dropped", dropped);
        if let Err(e) = self.write_realtime(session, self.adapter.cancel_bytes()) {
            tracing::warn!("Hold after unreadable stream not written: {}", e);
        }
    }

    /// Feed hold the machine after a failed command while job rows are
    /// still waiting; [`Controller::resume_stream`] continues from `Hold`
    fn hold_after_error(&self, session: &Session) {
        {
            let core = self.core.read();
            if !core.streaming || core.canceling || core.state != ControllerState::Run {
                return;
            }
        }
        if session.communicator.rows_remaining() == 0 {
            return;
        }
        if let Err(e) = self.write_realtime(session, self.adapter.pause_bytes()) {
            tracing::warn!("Feed hold after command error not written: {}", e);
            return;
        }
        if self.set_state(ControllerState::Hold) {
            self.console_info("Stream paused on command error");
        }
    }

    fn handle_line(&self, session_id: u64, line: &str) {
        let Some(session) = self.session_for(session_id) else {
            return;
        };
        let connecting = self.core.read().state == ControllerState::Disconnected;

        let outcome = session.communicator.handle_line(line);
        self.feed_query(line, &outcome);

        match &outcome.kind {
            ResponseKind::Status => self.apply_status(&session, line),
            ResponseKind::Alarm { code, message } => self.enter_alarm(&session, *code, message),
            ResponseKind::Error(_) if outcome.completed.is_some() => {
                self.hold_after_error(&session)
            }
            _ => {}
        }
        self.resolve_waiter(&outcome);

        if connecting && self.core.read().state == ControllerState::Disconnected {
            self.set_state(ControllerState::Idle);
        }
        self.settle(&session);
    }

    fn resolve_waiter(&self, outcome: &LineOutcome) {
        let Some(command) = &outcome.completed else {
            return;
        };
        if let Some(waiter) = self.waiters.lock().remove(&command.sequence()) {
            let _ = waiter.send(command.clone());
        }
    }

    fn apply_status(&self, session: &Session, line: &str) {
        let prior = self.core.read().status.clone();
        let Some(status) = self.adapter.parse_status(line, &prior) else {
            let error = FirmwareError::ResponseParseError {
                reason: format!("unreadable status report '{}'", line),
            };
            tracing::debug!("{}", error);
            self.events.publish(ControllerEvent::ConsoleMessage(
                MessageType::Verbose,
                error.to_string(),
            ));
            return;
        };
        session.polls.status_received();

        let status = Arc::new(status);
        let reported = status.state();
        let (current, streaming) = {
            let mut core = self.core.write();
            core.status = status.clone();
            (core.state, core.streaming)
        };
        self.events.publish(ControllerEvent::StatusUpdated(status));

        match reported {
            ControllerState::Disconnected => {}
            ControllerState::Alarm => self.enter_alarm(session, None, "alarm reported in status"),
            _ if current == ControllerState::Alarm => {}
            // Between buffered blocks the firmware can briefly report idle
            ControllerState::Idle if streaming => {}
            _ => {
                self.set_state(reported);
            }
        }
    }

    /// Alarms stop a running job; manual commands such as the unlock
    /// still go through
    fn enter_alarm(&self, session: &Session, code: Option<u32>, message: &str) {
        let (streaming, change) = {
            let mut core = self.core.write();
            if core.streaming {
                core.canceling = true;
            }
            if core.alarm.is_none() || code.is_some() {
                core.alarm = Some((code, message.to_string()));
            }
            let change = self.transition(&mut core, ControllerState::Alarm);
            (core.streaming, change)
        };
        if streaming {
            session.communicator.pause_send();
            let dropped = session.communicator.cancel_send();
            tracing::debug!("Alarm dropped {} unsent rows", dropped);
        }

        if change.is_some() {
            let text = match code {
                Some(code) => format!("ALARM:{} ({})", code, message),
                None => format!("Alarm: {}", message),
            };
            tracing::error!("{}", text);
            self.events
                .publish(ControllerEvent::ConsoleMessage(MessageType::Error, text));
        }
        self.announce(change);
    }

    /// Tear down session `id` if it is still the current one
    fn end_session(&self, id: u64, reason: &str) {
        let Some(session) = ({
            let mut slot = self.session.write();
            match slot.as_ref() {
                Some(session) if session.id == id => slot.take(),
                _ => None,
            }
        }) else {
            return;
        };

        let discarded = session.communicator.reset_buffers().len();
        self.waiters.lock().clear();
        self.query.lock().take();

        let change = {
            let mut core = self.core.write();
            core.streaming = false;
            core.canceling = false;
            core.alarm = None;
            core.status = Arc::new(ControllerStatus::disconnected());
            self.streaming_tx.send_replace(false);
            self.transition(&mut core, ControllerState::Disconnected)
        };

        tracing::info!("Disconnected: {} ({} in flight discarded)", reason, discarded);
        self.events.publish(ControllerEvent::Disconnected {
            reason: reason.to_string(),
            discarded,
        });
        self.announce(change);
        drop(session);
    }

    fn connection_lost(&self, id: u64, reason: &str) {
        if self.session_for(id).is_some() {
            tracing::error!("Connection lost: {}", reason);
        }
        self.end_session(id, reason);
    }
}

fn run_reader(
    shared: Weak<Shared>,
    session_id: u64,
    connection: Arc<dyn Connection>,
    shutdown: watch::Receiver<bool>,
) {
    let mut framer = LineFramer::new();
    let mut buf = [0u8; READ_CHUNK];

    loop {
        if shutdown.has_changed().unwrap_or(true) {
            break;
        }
        match connection.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                let lines = framer.push(&buf[..n]);
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                for line in lines {
                    tracing::trace!("<< {}", line);
                    shared.handle_line(session_id, &line);
                }
            }
            Err(e) => {
                if !shutdown.has_changed().unwrap_or(true) {
                    if let Some(shared) = shared.upgrade() {
                        shared.connection_lost(session_id, &e.to_string());
                    }
                }
                break;
            }
        }
    }
    tracing::debug!("Reader for session {} stopped", session_id);
}

async fn run_producer(
    shared: Weak<Shared>,
    session_id: u64,
    communicator: Arc<BufferedCommunicator>,
    mut shutdown: watch::Receiver<bool>,
) {
    let ready = communicator.ready_signal();
    loop {
        tokio::select! {
            _ = ready.notified() => {}
            _ = shutdown.changed() => break,
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.pump(session_id, &communicator);
    }
    tracing::debug!("Producer for session {} stopped", session_id);
}
