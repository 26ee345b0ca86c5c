//! Batch redelivery of messages parked on the error queue.
//!
//! The batch size is a point-in-time snapshot of the error queue's depth, taken
//! once up front - never re-queried mid-loop - so a batch terminates even while
//! new failures keep arriving.
use crate::amqp::{configuration::QueueBinding, ConnectionError, ConnectionFactory};
use crate::statistics::{StatisticsClient, StatisticsError};
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions},
    types::FieldTable,
    BasicProperties,
};
use tokio::time::timeout;
use uuid::Uuid;

/// How long to wait for the next error-queue message before counting the
/// attempt as spent.
const RECEIVE_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1000);

/// Error returned when a requeue batch cannot run.
///
/// Failures affecting a single message inside the batch - a republish that the
/// broker rejects - are logged and absorbed; they never surface here.
#[derive(Debug, thiserror::Error)]
pub enum RequeueError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("failed to read the error queue depth")]
    Statistics(#[from] StatisticsError),
    #[error("the broker connection failed during the requeue batch")]
    Transport(#[source] lapin::Error),
}

/// Moves messages parked on the error queue back to the input queue.
///
/// Requeuing is pure transport: the message handler is never invoked here, each
/// message is republished with its original body and correlation id and will be
/// reprocessed by the listener like any other delivery.
pub struct RequeueProcessor {
    factory: ConnectionFactory,
    queues: QueueBinding,
    statistics: StatisticsClient,
}

impl RequeueProcessor {
    pub fn new(
        factory: ConnectionFactory,
        queues: QueueBinding,
        statistics: StatisticsClient,
    ) -> Self {
        Self {
            factory,
            queues,
            statistics,
        }
    }

    /// Drain up to `depth` messages from the error queue - `depth` being the
    /// queue size measured when the batch starts - republishing each to the
    /// input queue. Returns the number of messages moved.
    ///
    /// The session is transactional with explicit acknowledgments: every receive
    /// is acknowledged and committed regardless of the republish outcome. A
    /// message whose republish fails is therefore dropped - an accepted risk of
    /// this design, locked in by a regression test.
    #[tracing::instrument(name = "requeue_failed", skip(self))]
    pub async fn requeue_failed(&self) -> Result<u64, RequeueError> {
        let count = self.statistics.queue_size(&self.queues.error_queue).await?;
        if count < 1 {
            return Ok(0);
        }
        tracing::info!(count, "requeuing failed messages");

        let channel = self.factory.get_channel().await?;
        channel.tx_select().await.map_err(RequeueError::Transport)?;
        let consumer = channel
            .basic_consume(
                &self.queues.error_queue,
                &Uuid::new_v4().to_string(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(RequeueError::Transport)?;
        let consumer_tag = consumer.tag().as_str().to_owned();

        let mut batch = AmqpBatch {
            channel: channel.clone(),
            consumer,
            input_queue: self.queues.input_queue.clone(),
            pending: None,
        };
        let moved = drain(&mut batch, count).await?;

        let _ = channel
            .basic_cancel(&consumer_tag, BasicCancelOptions::default())
            .await;
        Ok(moved)
    }
}

/// A message pulled off the error queue, ready to be sent back.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FailedMessage {
    body: String,
    correlation_id: Option<String>,
}

/// The transport operations a requeue batch performs.
///
/// The indirection keeps the drain loop - including its documented data-loss
/// boundary - exercisable in tests without a running broker.
#[async_trait::async_trait]
trait BatchTransport: Send {
    /// Receive the next error-queue message, waiting at most
    /// [`RECEIVE_TIMEOUT`]. `Ok(None)` means the wait timed out.
    async fn receive(&mut self) -> Result<Option<FailedMessage>, lapin::Error>;
    /// Republish a message to the input queue.
    async fn republish(&mut self, message: &FailedMessage) -> Result<(), lapin::Error>;
    /// Acknowledge the last received message and commit the transaction.
    async fn commit(&mut self) -> Result<(), lapin::Error>;
}

/// Run exactly `count` receive attempts against the error queue.
async fn drain(transport: &mut impl BatchTransport, count: u64) -> Result<u64, RequeueError> {
    let mut moved = 0;
    for _ in 0..count {
        let message = match transport.receive().await {
            Ok(Some(message)) => message,
            // The receive timed out - the attempt still counts. Fewer than
            // `count` messages end up moved when something else drains the
            // error queue concurrently.
            Ok(None) => continue,
            Err(error) => return Err(RequeueError::Transport(error)),
        };

        tracing::info!(body = %message.body, "requeuing message");
        match transport.republish(&message).await {
            Ok(()) => moved += 1,
            Err(error) => {
                tracing::error!(error = ?error, "failed to requeue message");
            }
        }

        // Acknowledge and commit whatever happened above: a message whose
        // republish failed leaves the error queue with no surviving copy.
        transport.commit().await.map_err(RequeueError::Transport)?;
    }
    Ok(moved)
}

struct AmqpBatch {
    channel: lapin::Channel,
    consumer: lapin::Consumer,
    input_queue: String,
    pending: Option<Delivery>,
}

#[async_trait::async_trait]
impl BatchTransport for AmqpBatch {
    async fn receive(&mut self) -> Result<Option<FailedMessage>, lapin::Error> {
        let delivery = match timeout(RECEIVE_TIMEOUT, self.consumer.next()).await {
            Err(_) => return Ok(None),
            Ok(Some(Ok(delivery))) => delivery,
            Ok(Some(Err(error))) => return Err(error),
            Ok(None) => {
                return Err(lapin::Error::InvalidChannelState(
                    lapin::ChannelState::Closed,
                ))
            }
        };

        let message = FailedMessage {
            body: String::from_utf8_lossy(&delivery.data).into_owned(),
            correlation_id: delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|id| id.as_str().to_owned()),
        };
        self.pending = Some(delivery);
        Ok(Some(message))
    }

    async fn republish(&mut self, message: &FailedMessage) -> Result<(), lapin::Error> {
        let mut properties = BasicProperties::default();
        if let Some(correlation_id) = &message.correlation_id {
            properties = properties.with_correlation_id(correlation_id.as_str().into());
        }
        self.channel
            .basic_publish(
                "",
                &self.input_queue,
                BasicPublishOptions::default(),
                message.body.as_bytes(),
                properties,
            )
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), lapin::Error> {
        if let Some(delivery) = self.pending.take() {
            delivery.ack(BasicAckOptions::default()).await?;
        }
        self.channel.tx_commit().await?;
        Ok(())
    }
}
