//! Periodic status requests
//!
//! A request is only written when the previous one has been answered. If
//! the firmware stays silent for [`MAX_OUTSTANDING_POLLS`] ticks the
//! counter starts over, so a dropped report never stops polling for good.

use crate::communicator::BufferedCommunicator;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Ticks without an answer before polling starts over
pub const MAX_OUTSTANDING_POLLS: u32 = 20;

/// Counts status requests that have not been answered yet
#[derive(Debug, Default)]
pub struct PollTracker {
    outstanding: AtomicU32,
}

impl PollTracker {
    /// Advance one tick; returns true if a request should be written now
    pub fn tick(&self) -> bool {
        let mut send = false;
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                send = n == 0;
                Some(match n {
                    0 => 1,
                    n if n + 1 >= MAX_OUTSTANDING_POLLS => 0,
                    n => n + 1,
                })
            });
        send
    }

    /// A status report arrived
    pub fn status_received(&self) {
        self.outstanding.store(0, Ordering::SeqCst);
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::SeqCst)
    }
}

/// Writes the firmware's status request on a fixed interval
pub struct StatusPoller {
    communicator: Arc<BufferedCommunicator>,
    tracker: Arc<PollTracker>,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(
        communicator: Arc<BufferedCommunicator>,
        tracker: Arc<PollTracker>,
        interval: Duration,
    ) -> Self {
        Self {
            communicator,
            tracker,
            interval,
        }
    }

    /// Poll until `shutdown` changes or its sender goes away
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let request = self.communicator.adapter().status_request().to_vec();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if !self.tracker.tick() {
                continue;
            }
            if let Err(e) = self.communicator.send_realtime(&request) {
                tracing::warn!("Status request failed, polling stopped: {}", e);
                break;
            }
        }
        tracing::debug!("Status poller stopped");
    }
}
