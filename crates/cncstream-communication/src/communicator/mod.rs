//! Sending side of the engine
//!
//! - [`LineFramer`]: splits received bytes into lines
//! - [`FlowControlLedger`]: tracks the firmware RX buffer
//! - [`BufferedCommunicator`]: queues, streams and correlates commands

pub mod buffered;
pub mod flow_control;
pub mod framing;

pub use buffered::{
    BufferedCommunicator, CommunicatorConfig, LineOutcome, SendReport, StreamCounters,
};
pub use flow_control::FlowControlLedger;
pub use framing::LineFramer;
