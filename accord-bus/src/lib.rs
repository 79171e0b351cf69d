//! # accord-bus
//!
//! In-process event bus connecting the accord components.
//!
//! Create one with [`EventBus::new`], subscribe with [`EventBus::register`]
//! and send with [`EventBus::publish`]. See [`bus`] for the dispatch model.

pub mod backoff;
pub mod breaker;
pub mod bus;
pub mod error;
pub mod event;
pub mod handler;

pub use breaker::{BreakerSnapshot, BreakerState};
pub use bus::{BusStats, DeadLetter, EventBus};
pub use error::{BusError, HandlerError};
pub use event::{topics, EnhancedEvent, EventMetadata, Priority, PublishOptions};
pub use handler::{detached, handler_fn, EventHandler, HandlerId, HandlerInfo, HandlerOptions};
