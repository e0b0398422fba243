//! # cncstream
//!
//! Flow-controlled G-code streaming for GRBL and TinyG controllers.
//!
//! ## Architecture
//!
//! The workspace is split into three crates:
//!
//! 1. **cncstream-core** - Commands, controller state and status, events,
//!    errors, and the on-disk stream store
//! 2. **cncstream-communication** - Connections, firmware adapters, flow
//!    control, and the controller state machine
//! 3. **cncstream-settings** - Persisted configuration
//!
//! This crate re-exports the pieces a front end needs and provides the
//! logging setup used by the `cncstream` binary.

pub use cncstream_communication::{
    list_ports, prepare_job, Connection, ConnectionParams, Controller, ControllerOptions,
    ControllerType, FirmwareAdapter, FirmwareSetting, GrblAdapter, MemoryConnection, MemoryPeer,
    QuerySpec, SerialConnection, SerialPortInfo, StreamCounters, TinyGAdapter,
};

pub use cncstream_core::{
    ControllerError, ControllerEvent, ControllerState, ControllerStatus, Error, EventCategory,
    EventDispatcher, EventFilter, GcodeCommand, GcodeStreamReader, GcodeStreamWriter,
    MessageType, Position, Result, Units,
};

pub use cncstream_settings::{Config, ConnectionSettings, SettingsError, StreamingSettings};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with the default configuration
///
/// Sets up structured logging with:
/// - Pretty console output on stderr, so stdout stays free for results
/// - RUST_LOG environment variable support
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_line_number(true)
        .pretty();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

/// Initialize logging as one JSON object per line on stderr
pub fn init_json_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let fmt_layer = fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}
