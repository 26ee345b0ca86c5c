//! End-to-end scenarios against a live AMQP broker.
//!
//! These tests expect an out-of-the-box broker on `localhost:5672` (e.g. the
//! official RabbitMQ Docker image) and are ignored by default:
//!
//! ```text
//! cargo test -- --ignored
//! ```
//!
//! The broker-side statistics feed is emulated by [`spawn_statistics_responder`],
//! which answers every query with the queue's real depth.

use amq_protocol_types::{AMQPValue, FieldTable};
use futures_util::StreamExt;
use homing_pigeon::amqp::configuration::{BrokerSettings, QueueBinding};
use homing_pigeon::amqp::ConnectionFactory;
use homing_pigeon::consumers::{ClosureHandler, HandlerError, Incoming};
use homing_pigeon::statistics::{StatisticsClient, StatisticsError};
use homing_pigeon::MessageQueue;
use lapin::{
    message::Delivery,
    options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions},
    BasicProperties, Channel,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

const STATISTICS_PREFIX: &str = "statistics.destination";

fn get_connection_factory() -> ConnectionFactory {
    ConnectionFactory::new_from_config(&BrokerSettings::default())
}

async fn get_channel(factory: &ConnectionFactory) -> Channel {
    factory
        .new_connection()
        .await
        .unwrap()
        .create_channel()
        .await
        .unwrap()
}

/// Random queue names so concurrent test runs cannot interfere.
fn random_queues() -> QueueBinding {
    QueueBinding {
        input_queue: Uuid::new_v4().to_string(),
        error_queue: Uuid::new_v4().to_string(),
    }
}

async fn declare_queue(channel: &Channel, queue_name: &str) {
    channel
        .queue_declare(
            queue_name,
            QueueDeclareOptions {
                auto_delete: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap();
}

async fn publish(channel: &Channel, queue_name: &str, body: &str, correlation_id: Option<&str>) {
    let mut properties = BasicProperties::default();
    if let Some(id) = correlation_id {
        properties = properties.with_correlation_id(id.into());
    }
    channel
        .basic_publish(
            "",
            queue_name,
            BasicPublishOptions::default(),
            body.as_bytes(),
            properties,
        )
        .await
        .unwrap();
}

/// Wait up to five seconds for a single message on `queue_name`.
async fn receive_one(channel: &Channel, queue_name: &str) -> Option<Delivery> {
    let mut consumer = channel
        .basic_consume(
            queue_name,
            &Uuid::new_v4().to_string(),
            BasicConsumeOptions {
                no_ack: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap();
    match tokio::time::timeout(Duration::from_secs(5), consumer.next()).await {
        Ok(Some(Ok(delivery))) => Some(delivery),
        _ => None,
    }
}

/// Emulate the broker's statistics feed for `queue_name`: every message
/// published to `<prefix>.<queue_name>` is answered on its `reply_to` queue
/// with a header table carrying the queue's current depth under `"size"`.
async fn spawn_statistics_responder(factory: &ConnectionFactory, queue_name: &str) {
    let channel = get_channel(factory).await;
    let feed = format!("{STATISTICS_PREFIX}.{queue_name}");
    declare_queue(&channel, &feed).await;
    let mut requests = channel
        .basic_consume(
            &feed,
            "statistics-responder",
            BasicConsumeOptions {
                no_ack: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap();

    let queue_name = queue_name.to_owned();
    tokio::spawn(async move {
        while let Some(Ok(request)) = requests.next().await {
            let reply_to = match request.properties.reply_to() {
                Some(reply_to) => reply_to.clone(),
                None => continue,
            };
            let depth = channel
                .queue_declare(
                    &queue_name,
                    QueueDeclareOptions {
                        passive: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .unwrap()
                .message_count();

            let mut headers = FieldTable::default();
            headers.insert("size".into(), AMQPValue::LongString(depth.to_string().into()));
            channel
                .basic_publish(
                    "",
                    reply_to.as_str(),
                    BasicPublishOptions::default(),
                    &[],
                    BasicProperties::default().with_headers(headers),
                )
                .await
                .unwrap();
        }
    });
}

#[tokio::test]
#[ignore = "requires a live AMQP broker on localhost"]
async fn a_failed_message_is_diverted_with_its_body_and_correlation_id() {
    let factory = get_connection_factory();
    let queues = random_queues();
    let channel = get_channel(&factory).await;
    declare_queue(&channel, &queues.input_queue).await;
    declare_queue(&channel, &queues.error_queue).await;

    let queue = MessageQueue::builder(factory, queues.clone(), ()).build();
    queue
        .start(ClosureHandler(|_incoming: Incoming<()>| async move {
            Err::<(), _>(HandlerError::msg("nope"))
        }))
        .await
        .unwrap();

    publish(&channel, &queues.input_queue, r#"{"answer": 42}"#, Some("abc-123")).await;

    let diverted = receive_one(&channel, &queues.error_queue)
        .await
        .expect("no message reached the error queue");
    assert_eq!(diverted.data, br#"{"answer": 42}"#.to_vec());
    assert_eq!(
        diverted.properties.correlation_id().as_ref().map(|id| id.as_str()),
        Some("abc-123")
    );
}

#[tokio::test]
#[ignore = "requires a live AMQP broker on localhost"]
async fn a_handled_message_never_reaches_the_error_queue() {
    #[derive(Default)]
    struct Context {
        seen: Mutex<Vec<serde_json::Value>>,
    }

    let factory = get_connection_factory();
    let queues = random_queues();
    let channel = get_channel(&factory).await;
    declare_queue(&channel, &queues.input_queue).await;
    declare_queue(&channel, &queues.error_queue).await;

    let context = Arc::new(Context::default());
    let queue = MessageQueue::builder(factory, queues.clone(), context.clone()).build();
    queue
        .start(ClosureHandler(|incoming: Incoming<Context>| async move {
            incoming.context.seen.lock().unwrap().push(incoming.payload);
            Ok::<_, HandlerError>(())
        }))
        .await
        .unwrap();

    publish(&channel, &queues.input_queue, r#"{"answer": 42}"#, None).await;

    let start = std::time::Instant::now();
    while context.seen.lock().unwrap().is_empty() {
        assert!(start.elapsed() < Duration::from_secs(5), "message not handled");
        tokio::task::yield_now().await;
    }
    assert!(receive_one(&channel, &queues.error_queue).await.is_none());
}

#[tokio::test]
#[ignore = "requires a live AMQP broker on localhost"]
async fn requeued_messages_return_to_the_input_queue_intact() {
    let factory = get_connection_factory();
    let queues = random_queues();
    let channel = get_channel(&factory).await;
    declare_queue(&channel, &queues.input_queue).await;
    declare_queue(&channel, &queues.error_queue).await;
    spawn_statistics_responder(&factory, &queues.error_queue).await;

    publish(&channel, &queues.error_queue, "one", Some("id-1")).await;
    publish(&channel, &queues.error_queue, "two", Some("id-2")).await;
    publish(&channel, &queues.error_queue, "three", Some("id-3")).await;
    // Give the broker a beat to count the publishes.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let queue = MessageQueue::builder(factory, queues.clone(), ()).build();
    let moved = queue.requeue_failed().await.unwrap();
    assert_eq!(moved, 3);

    let mut bodies = vec![];
    for _ in 0..3 {
        let delivery = receive_one(&channel, &queues.input_queue)
            .await
            .expect("requeued message missing from the input queue");
        bodies.push((
            String::from_utf8(delivery.data.clone()).unwrap(),
            delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|id| id.as_str().to_owned()),
        ));
    }
    bodies.sort();
    assert_eq!(
        bodies,
        vec![
            ("one".to_owned(), Some("id-1".to_owned())),
            ("three".to_owned(), Some("id-3".to_owned())),
            ("two".to_owned(), Some("id-2".to_owned())),
        ]
    );
}

#[tokio::test]
#[ignore = "requires a live AMQP broker on localhost"]
async fn requeue_on_an_empty_error_queue_is_a_no_op() {
    let factory = get_connection_factory();
    let queues = random_queues();
    let channel = get_channel(&factory).await;
    declare_queue(&channel, &queues.error_queue).await;
    spawn_statistics_responder(&factory, &queues.error_queue).await;

    let queue = MessageQueue::builder(factory, queues, ()).build();
    assert_eq!(queue.requeue_failed().await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires a live AMQP broker on localhost"]
async fn error_queue_size_reads_the_size_statistic() {
    let factory = get_connection_factory();
    let queues = random_queues();
    let channel = get_channel(&factory).await;
    declare_queue(&channel, &queues.error_queue).await;
    spawn_statistics_responder(&factory, &queues.error_queue).await;

    publish(&channel, &queues.error_queue, "one", None).await;
    publish(&channel, &queues.error_queue, "two", None).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let queue = MessageQueue::builder(factory, queues, ()).build();
    assert_eq!(queue.error_queue_size().await.unwrap(), 2);
}

#[tokio::test]
#[ignore = "requires a live AMQP broker on localhost"]
async fn an_unanswered_statistics_query_yields_an_empty_mapping() {
    let factory = get_connection_factory();
    let queue_name = Uuid::new_v4().to_string();
    let channel = get_channel(&factory).await;
    declare_queue(&channel, &queue_name).await;
    // No responder: the query must time out silently...
    let client = StatisticsClient::new(factory);
    let statistics = client.query(&queue_name).await.unwrap();
    assert!(statistics.is_empty());

    // ...while reading a size out of the silence is a parse error.
    assert!(matches!(
        client.queue_size(&queue_name).await,
        Err(StatisticsError::ParseSize { .. })
    ));
}
