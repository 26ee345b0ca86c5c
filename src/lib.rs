//! `homing-pigeon` is a resilient queue-consumer toolkit, built on top of [`lapin`],
//! for services that process work items pushed onto a broker queue.
//!
//! It keeps a long-lived subscription on an input queue and dispatches every
//! delivered message to a caller-supplied [`Handler`](crate::consumers::Handler).
//! Messages whose processing fails are diverted to an error queue, tagged with
//! the correlation id of the original delivery, where they wait for an operator
//! to inspect them or send them back with [`MessageQueue::requeue_failed`].
//! Broker connection failures after start-up are healed automatically.
//!
//! [`MessageQueue`] is the best starting point to learn more about what
//! `homing-pigeon` provides and how to leverage it.

pub mod amqp;
pub mod consumers;
pub mod requeue;
pub mod statistics;

mod message_queue;
pub use message_queue::{MessageQueue, MessageQueueBuilder};
