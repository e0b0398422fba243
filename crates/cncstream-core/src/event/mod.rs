//! # Events
//!
//! Typed notifications from the streaming engine and the dispatcher that
//! delivers them.
//!
//! ```rust,ignore
//! use cncstream_core::event::{ControllerEvent, EventCategory, EventDispatcher, EventFilter};
//!
//! let events = EventDispatcher::default();
//! let id = events.subscribe(
//!     EventFilter::Categories(vec![EventCategory::Stream]),
//!     |event| println!("{}", event),
//! );
//! events.unsubscribe(id);
//! ```

mod dispatcher;
mod events;

pub use dispatcher::*;
pub use events::*;
