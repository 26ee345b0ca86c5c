//! A synchronous request/reply protocol to read broker-reported statistics for a
//! destination.
//!
//! The broker exposes a live statistics feed per destination behind a well-known
//! management destination name. Publishing an empty message to it, with the
//! `reply_to` property pointing at an ephemeral queue, produces at most one
//! reply whose header table carries the statistics as name/value pairs.
use crate::amqp::{ConnectionError, ConnectionFactory};
use amq_protocol_types::{AMQPValue, FieldTable};
use futures_util::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions},
    BasicProperties,
};
use std::collections::HashMap;
use tokio::time::timeout;
use uuid::Uuid;

/// How long to wait for a statistics reply before concluding there is none.
const REPLY_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1000);

/// The default prefix of the management destination serving per-queue statistics.
///
/// The full destination name is `<prefix>.<queue_name>` - a broker-specific
/// convention, which is why [`StatisticsClient::with_destination_prefix`] can
/// override it.
pub const DEFAULT_DESTINATION_PREFIX: &str = "statistics.destination";

/// The statistics the broker reported for a single destination, as a mapping
/// from statistic name to string value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueStatistics(HashMap<String, String>);

impl QueueStatistics {
    /// Look up a statistic by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// `true` when the broker sent no reply within the timeout.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(String, String)> for QueueStatistics {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(entries: I) -> Self {
        Self(entries.into_iter().collect())
    }
}

/// Error returned when querying queue statistics.
#[derive(Debug, thiserror::Error)]
pub enum StatisticsError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("the statistics exchange with the broker failed for queue {queue_name}")]
    Exchange {
        queue_name: String,
        #[source]
        source: lapin::Error,
    },
    /// The reply did not contain a `"size"` entry, or the entry was not a
    /// non-negative integer.
    #[error("failed to read the queue size for {queue_name}")]
    ParseSize { queue_name: String },
}

/// Reads broker-reported statistics for arbitrary destinations.
///
/// Each query opens its own connection and allocates a fresh reply queue; no
/// state is shared across calls and no reply destination is ever reused.
#[derive(Clone)]
pub struct StatisticsClient {
    factory: ConnectionFactory,
    destination_prefix: String,
}

impl StatisticsClient {
    pub fn new(factory: ConnectionFactory) -> Self {
        Self {
            factory,
            destination_prefix: DEFAULT_DESTINATION_PREFIX.into(),
        }
    }

    /// Override the management-destination prefix used to address the broker's
    /// statistics feed.
    #[must_use]
    pub fn with_destination_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.destination_prefix = prefix.into();
        self
    }

    /// Query the broker's statistics for `queue_name`.
    ///
    /// No reply within the timeout is a valid, silent outcome: it yields an
    /// empty [`QueueStatistics`], not an error.
    #[tracing::instrument(name = "queue_statistics", skip(self))]
    pub async fn query(&self, queue_name: &str) -> Result<QueueStatistics, StatisticsError> {
        let exchange_failure = |source| StatisticsError::Exchange {
            queue_name: queue_name.to_owned(),
            source,
        };

        let channel = self.factory.get_channel().await?;

        // Ephemeral reply queue: broker-named, auto-deleted once the channel goes.
        let reply_queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(exchange_failure)?;

        let destination = format!("{}.{}", self.destination_prefix, queue_name);
        let properties = BasicProperties::default().with_reply_to(reply_queue.name().clone());
        channel
            .basic_publish(
                "",
                &destination,
                BasicPublishOptions::default(),
                &[],
                properties,
            )
            .await
            .map_err(exchange_failure)?;

        let mut replies = channel
            .basic_consume(
                reply_queue.name().as_str(),
                &Uuid::new_v4().to_string(),
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(exchange_failure)?;

        let reply = match timeout(REPLY_TIMEOUT, replies.next()).await {
            // Absence of statistics is not an error.
            Err(_) => return Ok(QueueStatistics::default()),
            Ok(Some(Ok(reply))) => reply,
            Ok(Some(Err(source))) => return Err(exchange_failure(source)),
            Ok(None) => {
                return Err(exchange_failure(lapin::Error::InvalidChannelState(
                    lapin::ChannelState::Closed,
                )))
            }
        };

        Ok(reply
            .properties
            .headers()
            .as_ref()
            .map(statistics_from_headers)
            .unwrap_or_default())
    }

    /// The current depth of `queue_name`, read from the `"size"` statistic.
    pub async fn queue_size(&self, queue_name: &str) -> Result<u64, StatisticsError> {
        let statistics = self.query(queue_name).await?;
        parse_size(&statistics, queue_name)
    }
}

/// Copy every name/value pair of a statistics reply into a [`QueueStatistics`].
///
/// Values are coerced to strings; entries with no string rendition are skipped.
fn statistics_from_headers(headers: &FieldTable) -> QueueStatistics {
    headers
        .inner()
        .iter()
        .filter_map(|(name, value)| {
            coerce_to_string(value).map(|value| (name.as_str().to_owned(), value))
        })
        .collect()
}

fn coerce_to_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_owned()),
        AMQPValue::Boolean(v) => Some(v.to_string()),
        AMQPValue::ShortShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortShortUInt(v) => Some(v.to_string()),
        AMQPValue::ShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortUInt(v) => Some(v.to_string()),
        AMQPValue::LongInt(v) => Some(v.to_string()),
        AMQPValue::LongUInt(v) => Some(v.to_string()),
        AMQPValue::LongLongInt(v) => Some(v.to_string()),
        AMQPValue::Float(v) => Some(v.to_string()),
        AMQPValue::Double(v) => Some(v.to_string()),
        AMQPValue::Timestamp(v) => Some(v.to_string()),
        _ => None,
    }
}

fn parse_size(statistics: &QueueStatistics, queue_name: &str) -> Result<u64, StatisticsError> {
    statistics
        .get("size")
        .and_then(|size| size.parse().ok())
        .ok_or_else(|| StatisticsError::ParseSize {
            queue_name: queue_name.to_owned(),
        })
}
