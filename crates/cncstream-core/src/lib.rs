//! # cncstream core
//!
//! Core types shared by the streaming engine:
//! commands and their response classification, controller state and
//! status snapshots, the typed event surface, the error taxonomy, and the
//! bounded-memory stream store.

pub mod command;
pub mod data;
pub mod error;
pub mod event;
pub mod stream;

pub use command::{
    classify_response, split_comment, CommandNumberGenerator, GcodeCommand, ResponseClass,
};

pub use data::{
    AccessoryStates, BufferState, ControllerState, ControllerStatus, ControllerStatusBuilder,
    EnabledPins, OverridePercents, Position, Units,
};

pub use error::{ConnectionError, ControllerError, Error, FirmwareError, Result, StreamError};

pub use event::{
    ControllerEvent, EventCategory, EventDispatcher, EventFilter, MessageType, SubscriptionId,
};

pub use stream::{GcodeStreamReader, GcodeStreamWriter, StreamRecord};
