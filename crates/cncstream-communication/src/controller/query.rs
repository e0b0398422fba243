//! Request/response exchanges layered over the normal command stream
//!
//! A query waits for the controller to be ready, sends its trigger as an
//! ordinary command and collects the lines its [`QuerySpec`] accepts. Only
//! one query is active at a time.

use super::{Controller, Shared};
use crate::communicator::LineOutcome;
use crate::firmware::{FirmwareSetting, QuerySpec};
use cncstream_core::{ControllerError, Result};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

type QueryReply = std::result::Result<Vec<String>, String>;

pub(super) struct ActiveQuery {
    spec: QuerySpec,
    trigger_sequence: u64,
    lines: Vec<String>,
    matched: bool,
    reply: oneshot::Sender<QueryReply>,
}

impl Controller {
    /// Run a query and return the lines it collected.
    ///
    /// The timeout covers both the wait for a ready state and the exchange
    /// itself. A terminal line only ends the query after at least one line
    /// matched, so stale acknowledgments of earlier commands are ignored.
    pub async fn query(&self, spec: QuerySpec, timeout: Duration) -> Result<Vec<String>> {
        let deadline = Instant::now() + timeout;
        let timed_out = || -> cncstream_core::Error {
            ControllerError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }
            .into()
        };

        let session = self.shared.require_session()?;
        let mut states = self.shared.state_tx.subscribe();
        match tokio::time::timeout_at(deadline, states.wait_for(|s| s.is_ready())).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => return Err(ControllerError::NotConnected.into()),
            Err(_) => return Err(timed_out()),
        }

        let command = self.shared.create_command(spec.trigger());
        let trigger_sequence = command.sequence();
        let (reply, response) = oneshot::channel();
        {
            let mut slot = self.shared.query.lock();
            if slot.is_some() {
                return Err(ControllerError::InvalidState {
                    operation: "start a query".to_string(),
                    state: "running another query".to_string(),
                }
                .into());
            }
            *slot = Some(ActiveQuery {
                spec,
                trigger_sequence,
                lines: Vec::new(),
                matched: false,
                reply,
            });
        }

        if let Err(e) = self.shared.submit(&session, command) {
            self.shared.query.lock().take();
            return Err(e);
        }

        match tokio::time::timeout_at(deadline, response).await {
            Ok(Ok(Ok(lines))) => Ok(lines),
            Ok(Ok(Err(reason))) => Err(ControllerError::CommandRejected { reason }.into()),
            Ok(Err(_)) => Err(ControllerError::NotConnected.into()),
            Err(_) => {
                self.shared.query.lock().take();
                Err(timed_out())
            }
        }
    }

    /// Read the firmware settings
    pub async fn settings(&self) -> Result<Vec<FirmwareSetting>> {
        let spec = self.shared.adapter.settings_query();
        let lines = self.query(spec, self.shared.options.query_timeout).await?;
        Ok(self.shared.adapter.parse_settings(&lines))
    }
}

impl Shared {
    /// Offer a received line to the active query
    pub(super) fn feed_query(&self, line: &str, outcome: &LineOutcome) {
        let mut slot = self.query.lock();
        let Some(active) = slot.as_mut() else {
            return;
        };

        let trigger_failed = outcome
            .completed
            .as_ref()
            .filter(|c| c.sequence() == active.trigger_sequence && c.is_error());
        if let Some(command) = trigger_failed {
            let reason = command.error_message().unwrap_or_default().to_string();
            if let Some(active) = slot.take() {
                let _ = active.reply.send(Err(reason));
            }
            return;
        }

        if active.spec.is_match(line) {
            active.matched = true;
            active.lines.push(line.to_string());
        }
        if active.matched && active.spec.is_terminal(line) {
            if let Some(active) = slot.take() {
                tracing::debug!(
                    "Query {} collected {} lines",
                    active.spec.trigger(),
                    active.lines.len()
                );
                let _ = active.reply.send(Ok(active.lines));
            }
        }
    }
}
