use crate::{
    amqp::{configuration::QueueBinding, ConnectionError, ConnectionFactory},
    consumers::{Handler, Incoming, ListenerError},
};
use futures_util::{Stream, StreamExt};
use lapin::{
    message::Delivery,
    options::{BasicConsumeOptions, BasicPublishOptions},
    types::FieldTable,
    BasicProperties,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

/// Fixed delay between reconnection attempts after a transport failure.
const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(10);

/// A long-lived subscription to the input queue.
///
/// `QueueListener` consumes messages in auto-acknowledge mode and feeds them, one
/// at a time, to the [`Handler`] passed to [`QueueListener::start`]. A message is
/// fully processed - including the error-queue write-back, if any - before the
/// next one is picked up.
///
/// # Failure recovery
///
/// Transport failures reported by the broker *after* a successful subscription
/// trigger an automatic re-subscription on a fresh connection, retried every
/// 10 seconds until it succeeds. A failure while establishing the *initial*
/// subscription is logged and leaves the listener stopped: `start` does not
/// retry. Only runtime failures are self-healing.
pub struct QueueListener<C> {
    factory: ConnectionFactory,
    queues: QueueBinding,
    context: Arc<C>,
    started: AtomicBool,
}

impl<C: Send + Sync + 'static> QueueListener<C> {
    /// Create a listener bound to the queues in `queues`.
    ///
    /// No connection is opened until [`QueueListener::start`] is invoked.
    pub fn new(
        factory: ConnectionFactory,
        queues: QueueBinding,
        context: impl Into<Arc<C>>,
    ) -> Self {
        Self {
            factory,
            queues,
            context: context.into(),
            started: AtomicBool::new(false),
        }
    }

    /// Subscribe to the input queue and begin dispatching messages to `handler`.
    ///
    /// Returns once the subscription is registered; message delivery continues
    /// asynchronously on a spawned task.
    ///
    /// A listener instance may be started at most once over its lifetime:
    /// subsequent calls fail with [`ListenerError::AlreadyStarted`] rather than
    /// creating a second subscription - even if the first attempt failed to
    /// reach the broker.
    pub async fn start(&self, handler: impl Handler<C>) -> Result<(), ListenerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ListenerError::AlreadyStarted);
        }

        tracing::debug!("starting listener");
        let handler: Arc<dyn Handler<C>> = Arc::new(handler);
        match Subscription::establish(&self.factory, &self.queues.input_queue).await {
            Ok(subscription) => {
                tokio::spawn(run(
                    subscription,
                    self.factory.clone(),
                    self.queues.clone(),
                    self.context.clone(),
                    handler,
                ));
                Ok(())
            }
            Err(error) => {
                // Start-time failures are terminal for this start call: the
                // listener stays stopped and no automatic retry is attempted.
                tracing::error!(error = ?error, "failed to initialize the queue consumer");
                Ok(())
            }
        }
    }
}

/// The transport primitives backing one subscription attempt.
///
/// A fresh `Subscription` is established on every reconnection attempt; nothing
/// is shared across attempts besides the listener's start guard.
struct Subscription {
    /// Keeps the error-callback registration (and the connection it lives on)
    /// alive for as long as the consumer runs.
    _connection: lapin::Connection,
    channel: lapin::Channel,
    consumer: lapin::Consumer,
    failures: mpsc::UnboundedReceiver<lapin::Error>,
}

impl Subscription {
    async fn establish(
        factory: &ConnectionFactory,
        input_queue: &str,
    ) -> Result<Self, ConnectionError> {
        let connection = factory.new_connection().await?;

        let (failure_sender, failures) = mpsc::unbounded_channel();
        connection.on_error(move |error| {
            let _ = failure_sender.send(error);
        });

        let channel = connection.create_channel().await?;
        let consumer = channel
            .basic_consume(
                input_queue,
                &Uuid::new_v4().to_string(),
                BasicConsumeOptions {
                    // Auto-acknowledge: the broker considers a message consumed on
                    // delivery, whatever the processing outcome.
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        tracing::debug!(queue_name = %input_queue, "listening");

        Ok(Self {
            _connection: connection,
            channel,
            consumer,
            failures,
        })
    }
}

/// The listener's delivery-and-reconnect loop.
///
/// Alternates between draining deliveries from the current subscription and,
/// once the transport fails, re-establishing a fresh one after a fixed delay.
/// There is no terminal failure state: reconnection is attempted indefinitely.
async fn run<C: Send + Sync + 'static>(
    mut subscription: Subscription,
    factory: ConnectionFactory,
    queues: QueueBinding,
    context: Arc<C>,
    handler: Arc<dyn Handler<C>>,
) {
    loop {
        let mut error_queue = ErrorQueue {
            channel: subscription.channel.clone(),
            queue_name: queues.error_queue.clone(),
        };
        let failure = deliver(
            &mut subscription.consumer,
            &mut subscription.failures,
            &mut error_queue,
            handler.as_ref(),
            &context,
            &queues.input_queue,
        )
        .await;
        tracing::error!(
            error = ?failure,
            "queue listener failed, restarting in {} seconds",
            RECONNECT_DELAY.as_secs()
        );

        subscription = loop {
            tokio::time::sleep(RECONNECT_DELAY).await;
            match Subscription::establish(&factory, &queues.input_queue).await {
                Ok(fresh) => break fresh,
                Err(error) => {
                    tracing::error!(
                        error = ?error,
                        "reconnection attempt failed, retrying in {} seconds",
                        RECONNECT_DELAY.as_secs()
                    );
                }
            }
        };
    }
}

/// Consume deliveries until the transport fails, returning the failure.
///
/// Both the connection's error callback and the consumer stream ending count as
/// transport failures.
async fn deliver<C, S>(
    consumer: &mut S,
    failures: &mut mpsc::UnboundedReceiver<lapin::Error>,
    error_queue: &mut impl DivertSink,
    handler: &dyn Handler<C>,
    context: &Arc<C>,
    queue_name: &str,
) -> anyhow::Error
where
    C: Send + Sync + 'static,
    S: Stream<Item = Result<Delivery, lapin::Error>> + Unpin,
{
    loop {
        tokio::select! {
            failure = failures.recv() => {
                return match failure {
                    Some(error) => anyhow::Error::from(error).context("the broker reported a connection failure"),
                    None => anyhow::anyhow!("the connection failure callback was dropped"),
                };
            }
            event = consumer.next() => match event {
                Some(Ok(delivery)) => {
                    match dispose(handler, context, queue_name, &delivery).await {
                        Disposition::Handled | Disposition::Ignored => {}
                        Disposition::Divert { body, correlation_id } => {
                            // The message was consumed in auto-acknowledge mode, so a
                            // failed write-back cannot be recovered - log and move on.
                            if let Err(error) = error_queue.divert(&body, &correlation_id).await {
                                tracing::error!(error = ?error, "failed to publish to the error queue");
                            }
                        }
                    }
                }
                Some(Err(error)) => {
                    return anyhow::Error::from(error).context("the consumer stream failed");
                }
                None => return anyhow::anyhow!("the broker closed the message stream"),
            }
        }
    }
}

/// The outcome of processing a single delivery.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    /// The handler processed the message.
    Handled,
    /// Not a text message - dropped without further processing.
    Ignored,
    /// Parsing or handling failed: the original raw body must be republished to
    /// the error queue under the same correlation id.
    Divert {
        body: String,
        correlation_id: String,
    },
}

/// Run the per-message path for one delivery and decide what happens to it.
async fn dispose<C: Send + Sync + 'static>(
    handler: &dyn Handler<C>,
    context: &Arc<C>,
    queue_name: &str,
    delivery: &Delivery,
) -> Disposition {
    let text = match std::str::from_utf8(&delivery.data) {
        Ok(text) => text,
        Err(_) => {
            tracing::debug!("ignoring non-text message");
            return Disposition::Ignored;
        }
    };
    let correlation_id = correlation_id(&delivery.properties)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // The span stands in for an ambient diagnostic context: everything logged
    // while this message is in flight - including by the handler - carries its
    // correlation id, and the scope closes with the message.
    let span = tracing::info_span!("message", correlation_id = %correlation_id);
    async {
        tracing::info!(body = %text, "received message");

        let payload: serde_json::Value = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(error = ?error, "failed to parse message");
                return Disposition::Divert {
                    body: text.to_owned(),
                    correlation_id: correlation_id.clone(),
                };
            }
        };

        let incoming = Incoming {
            context: context.clone(),
            payload,
            correlation_id: correlation_id.clone(),
            queue_name: queue_name.to_owned(),
        };
        match handler.handle(incoming).await {
            Ok(()) => Disposition::Handled,
            Err(error) => {
                tracing::error!(error = %error, "failed to process message");
                Disposition::Divert {
                    body: text.to_owned(),
                    correlation_id: correlation_id.clone(),
                }
            }
        }
    }
    .instrument(span)
    .await
}

/// Extract the correlation id of a delivery, if present and non-empty.
fn correlation_id(properties: &BasicProperties) -> Option<String> {
    properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str())
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

/// Where diverted messages go.
///
/// The indirection keeps the delivery loop exercisable in tests without a
/// running broker.
#[async_trait::async_trait]
trait DivertSink: Send {
    async fn divert(&mut self, body: &str, correlation_id: &str) -> Result<(), lapin::Error>;
}

/// Publishes diverted messages to the error queue on the subscription's own channel.
struct ErrorQueue {
    channel: lapin::Channel,
    queue_name: String,
}

#[async_trait::async_trait]
impl DivertSink for ErrorQueue {
    async fn divert(&mut self, body: &str, correlation_id: &str) -> Result<(), lapin::Error> {
        let properties = BasicProperties::default().with_correlation_id(correlation_id.into());
        self.channel
            .basic_publish(
                "",
                &self.queue_name,
                BasicPublishOptions::default(),
                body.as_bytes(),
                properties,
            )
            .await?;
        Ok(())
    }
}
