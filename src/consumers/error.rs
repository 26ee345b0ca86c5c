use std::fmt;

/// The error type returned by message handlers.
///
/// The listener does not inspect it: every handler failure is treated the same
/// way, by diverting the message to the error queue. The wrapped error is only
/// used for logging.
#[derive(Debug)]
pub struct HandlerError(anyhow::Error);

impl HandlerError {
    /// Wrap an arbitrary error into a `HandlerError`.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self(error.into())
    }

    /// Build a `HandlerError` from a plain message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self(anyhow::Error::msg(message))
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handling of a message failed: {:#}", self.0)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        Self(error)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self(error.into())
    }
}

/// The error returned by [`QueueListener::start`](crate::consumers::QueueListener::start).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ListenerError {
    /// A listener instance may be started at most once over its lifetime.
    #[error("the listener has already been started")]
    AlreadyStarted,
}
