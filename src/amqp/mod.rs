//! Helpers for connecting to the message broker.

pub mod configuration;
mod factory;
pub use factory::{ConnectionError, ConnectionFactory};
pub use lapin::{Channel, Connection};

pub use lapin::{options, types, BasicProperties};
