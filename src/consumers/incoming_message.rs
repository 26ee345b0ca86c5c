use std::sync::Arc;

/// A dequeued message enriched with some auxiliary data, ready for processing.
///
/// `Incoming` is the input type of our message handler functions (check out
/// [`Handler`](crate::consumers::Handler)'s docs for more details).
pub struct Incoming<C> {
    /// `context` is a set of resources that are required to process the message and are outside
    /// the lifecycle of the message itself - e.g. an HTTP client for a third-party API, a db connection
    /// pool, etc.
    ///
    /// # Ownership
    ///
    /// The context is behind an `Arc` pointer: this allows multiple messages to access the same
    /// context without having to create an ad-hoc instance of `context` for each
    /// message - it might be expensive!
    pub context: Arc<C>,
    /// The message body, parsed as JSON.
    pub payload: serde_json::Value,
    /// The correlation id tying this message to its originating request.
    ///
    /// Copied from the delivery when present and non-empty, freshly generated
    /// otherwise. If processing fails, the error-queue copy of this message
    /// carries the same id, so it stays traceable across the round trip.
    pub correlation_id: String,
    /// The name of the queue the message was consumed from.
    pub queue_name: String,
}
