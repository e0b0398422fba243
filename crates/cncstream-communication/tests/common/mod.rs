//! Shared setup for controller integration tests

#![allow(dead_code)]

use cncstream_communication::{
    Controller, ControllerOptions, FirmwareAdapter, GrblAdapter, MemoryConnection, MemoryPeer,
};
use cncstream_core::{ControllerEvent, ControllerState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(2);
pub const WELCOME: &str = "Grbl 1.1h ['$' for help]";

pub struct Rig {
    pub controller: Controller,
    pub peer: MemoryPeer,
    pub events: broadcast::Receiver<ControllerEvent>,
}

pub fn options(buffer_size: usize) -> ControllerOptions {
    ControllerOptions {
        buffer_size: Some(buffer_size),
        status_poll_interval: Duration::ZERO,
        query_timeout: Duration::from_millis(500),
        ..ControllerOptions::default()
    }
}

/// Connect a GRBL controller to an in-memory peer and wait for `Idle`
pub async fn connect_grbl(options: ControllerOptions) -> Rig {
    connect_with(Arc::new(GrblAdapter::new()), options, WELCOME).await
}

/// Connect `adapter` to an in-memory peer that greets with `welcome`
pub async fn connect_with(
    adapter: Arc<dyn FirmwareAdapter>,
    options: ControllerOptions,
    welcome: &str,
) -> Rig {
    let controller = Controller::new(adapter, options);
    let events = controller.events().receiver();
    let (connection, peer) = MemoryConnection::named("test");
    controller.connect(Arc::new(connection)).unwrap();

    peer.send_line(welcome);
    let state = controller.wait_until_ready(WAIT).await.unwrap();
    assert_eq!(state, ControllerState::Idle);

    Rig {
        controller,
        peer,
        events,
    }
}

/// Receive events until one matches `predicate`
pub async fn expect_event<F>(
    events: &mut broadcast::Receiver<ControllerEvent>,
    mut predicate: F,
) -> ControllerEvent
where
    F: FnMut(&ControllerEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(WAIT, wait)
        .await
        .expect("timed out waiting for event")
}

/// Drain events that are already queued
pub fn drain(events: &mut broadcast::Receiver<ControllerEvent>) -> Vec<ControllerEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

/// Let the background workers run for a moment
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
