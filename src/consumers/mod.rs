//! Facilities to consume messages from the input queue. Check out [`QueueListener`]
//! as a starting point.
pub use error::{HandlerError, ListenerError};
pub use handler::{AsyncClosure, ClosureHandler, Handler};
pub use incoming_message::Incoming;
pub use listener::QueueListener;

mod error;
mod handler;
mod incoming_message;
mod listener;
