use crate::{
    amqp::{configuration::QueueBinding, ConnectionFactory},
    consumers::{Handler, ListenerError, QueueListener},
    requeue::{RequeueError, RequeueProcessor},
    statistics::{StatisticsClient, StatisticsError},
};
use std::sync::Arc;

/// The operator-facing surface of the subsystem: one input queue, one error
/// queue, three operations.
///
/// - [`MessageQueue::start`] - subscribe to the input queue and dispatch every
///   message to a handler, diverting failures to the error queue;
/// - [`MessageQueue::error_queue_size`] - the point-in-time depth of the error
///   queue;
/// - [`MessageQueue::requeue_failed`] - move the error queue's contents back to
///   the input queue for reprocessing.
///
/// Every operation opens its own broker connection; nothing is pooled or shared
/// between them.
///
/// # How do I build a `MessageQueue`?
///
/// `MessageQueue` provides a fluent API to add configuration step-by-step,
/// known as "builder pattern" in Rust.
/// The starting point is [`MessageQueue::builder`].
///
/// # Example
///
/// ```rust,no_run
/// use homing_pigeon::amqp::configuration::{BrokerSettings, QueueBinding};
/// use homing_pigeon::amqp::ConnectionFactory;
/// use homing_pigeon::consumers::{ClosureHandler, HandlerError, Incoming};
/// use homing_pigeon::MessageQueue;
///
/// async fn example() -> anyhow::Result<()> {
///     let factory = ConnectionFactory::new_from_config(&BrokerSettings::default());
///     let queue = MessageQueue::builder(
///         factory,
///         QueueBinding {
///             input_queue: "work.input".into(),
///             error_queue: "work.error".into(),
///         },
///         (),
///     )
///     .build();
///
///     queue
///         .start(ClosureHandler(|incoming: Incoming<()>| async move {
///             println!("{}", incoming.payload);
///             Ok::<_, HandlerError>(())
///         }))
///         .await?;
///     Ok(())
/// }
/// ```
pub struct MessageQueue<C> {
    listener: QueueListener<C>,
    statistics: StatisticsClient,
    requeue: RequeueProcessor,
    error_queue: String,
}

impl<C: Send + Sync + 'static> MessageQueue<C> {
    /// Start building a [`MessageQueue`].
    ///
    /// You will need a connection factory, the queue pair to operate on and a
    /// context - the set of resources handlers need to process a message,
    /// shared behind an `Arc` (it won't be "double-wrapped" if it is one
    /// already).
    pub fn builder(
        factory: ConnectionFactory,
        queues: QueueBinding,
        context: impl Into<Arc<C>>,
    ) -> MessageQueueBuilder<C> {
        MessageQueueBuilder {
            factory,
            queues,
            context: context.into(),
            statistics_prefix: None,
        }
    }

    /// Subscribe to the input queue and dispatch messages to `handler`.
    ///
    /// See [`QueueListener::start`] for the lifecycle rules - notably the
    /// at-most-one-start guard.
    pub async fn start(&self, handler: impl Handler<C>) -> Result<(), ListenerError> {
        self.listener.start(handler).await
    }

    /// The current depth of the error queue.
    pub async fn error_queue_size(&self) -> Result<u64, StatisticsError> {
        self.statistics.queue_size(&self.error_queue).await
    }

    /// Move the messages currently parked on the error queue back to the input
    /// queue. Returns the number of messages moved.
    pub async fn requeue_failed(&self) -> Result<u64, RequeueError> {
        self.requeue.requeue_failed().await
    }
}

/// A builder for [`MessageQueue`].
///
/// Use [`MessageQueue::builder`] as entrypoint.
pub struct MessageQueueBuilder<C> {
    factory: ConnectionFactory,
    queues: QueueBinding,
    context: Arc<C>,
    statistics_prefix: Option<String>,
}

impl<C: Send + Sync + 'static> MessageQueueBuilder<C> {
    /// Override the broker-specific management-destination prefix used for
    /// statistics queries.
    #[must_use]
    pub fn statistics_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.statistics_prefix = Some(prefix.into());
        self
    }

    /// Finalise the builder and get an instance of [`MessageQueue`].
    ///
    /// No connection is opened at this point.
    pub fn build(self) -> MessageQueue<C> {
        let mut statistics = StatisticsClient::new(self.factory.clone());
        if let Some(prefix) = self.statistics_prefix {
            statistics = statistics.with_destination_prefix(prefix);
        }
        MessageQueue {
            listener: QueueListener::new(
                self.factory.clone(),
                self.queues.clone(),
                self.context,
            ),
            requeue: RequeueProcessor::new(
                self.factory,
                self.queues.clone(),
                statistics.clone(),
            ),
            statistics,
            error_queue: self.queues.error_queue,
        }
    }
}
