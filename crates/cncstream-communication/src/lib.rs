//! # cncstream communication
//!
//! Everything between a G-code job and the wire: byte transports, firmware
//! adapters for GRBL and TinyG, character-counting flow control, and the
//! controller state machine that ties them together.

pub mod communicator;
pub mod connection;
pub mod controller;
pub mod firmware;
pub mod job;

pub use communicator::{
    BufferedCommunicator, CommunicatorConfig, FlowControlLedger, LineFramer, LineOutcome,
    SendReport, StreamCounters,
};
pub use connection::{
    list_ports, Connection, ConnectionParams, MemoryConnection, MemoryPeer, SerialConnection,
    SerialParity, SerialPortInfo,
};
pub use controller::{Controller, ControllerOptions, PollTracker, StatusPoller};
pub use firmware::{
    ControllerType, FirmwareAdapter, FirmwareSetting, GrblAdapter, QuerySpec, ResponseKind,
    TinyGAdapter,
};
pub use job::prepare_job;
