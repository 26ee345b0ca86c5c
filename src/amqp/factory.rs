use crate::amqp::configuration::BrokerSettings;
use anyhow::anyhow;
use lapin::{uri::AMQPUri, ConnectionProperties};
use tokio::time::timeout;

/// The error returned when a connection (or a channel on top of it) could not be
/// opened - the broker is unreachable, the credentials were rejected, or the
/// connection attempt timed out.
///
/// No retry is attempted by the factory; retry policy belongs to the caller.
#[derive(Debug, thiserror::Error)]
#[error("failed to connect to the message broker")]
pub struct ConnectionError(#[source] anyhow::Error);

impl From<lapin::Error> for ConnectionError {
    fn from(error: lapin::Error) -> Self {
        Self(error.into())
    }
}

#[derive(Clone)]
/// All the information required to connect to the message broker.
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// The timeout observed when trying to connect to the broker.
    connection_timeout: std::time::Duration,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// A connection timeout can be (optionally) specified in `settings`.
    /// If the connection timeout is left unspecified, it will be defaulted to 10 seconds.
    pub fn new_from_config(settings: &BrokerSettings) -> Self {
        let connection_timeout = settings
            .connection_timeout()
            .unwrap_or_else(|| std::time::Duration::from_secs(10));
        Self {
            uri: settings.amqp_uri(),
            connection_timeout,
        }
    }

    /// Open a new connection to the message broker.
    ///
    /// The connection carries an installable error callback
    /// ([`lapin::Connection::on_error`]) invoked by the broker client on fatal
    /// transport errors - the listener relies on it to trigger reconnection.
    /// The factory itself does not register one: `lapin` keeps a single error
    /// handler per connection and the caller owns it.
    #[tracing::instrument(name = "broker_connect", skip(self))]
    pub async fn new_connection(&self) -> Result<lapin::Connection, ConnectionError> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connection = timeout(
            self.connection_timeout,
            lapin::Connection::connect_uri(self.uri.clone(), properties),
        )
        .await
        .map_err(|_| {
            ConnectionError(anyhow!(
                "connection attempt timed out after {:?}",
                self.connection_timeout
            ))
        })??;
        Ok(connection)
    }

    /// Open a new connection and a channel on top of it.
    pub async fn get_channel(&self) -> Result<lapin::Channel, ConnectionError> {
        let connection = self.new_connection().await?;
        let channel = connection.create_channel().await?;
        Ok(channel)
    }
}
