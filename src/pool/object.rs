//! A connection plus one operational channel.

use std::{fmt, sync::Arc};

use crate::{
    error::TransportError,
    shutdown::{BestEffort, ShutdownError},
    transport::{BrokerChannel, BrokerConnection, TransportBackend},
};

/// Connection and channel owned by exactly one borrower at a time.
pub struct ConnectionObject {
    id: u64,
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

impl fmt::Debug for ConnectionObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionObject")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ConnectionObject {
    /// Connect to `uri` and open a channel.
    ///
    /// A connection whose channel cannot be opened is closed before the
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`TransportError`] if either step fails.
    pub async fn open(
        backend: &dyn TransportBackend,
        uri: &str,
        id: u64,
    ) -> Result<Self, TransportError> {
        let connection = backend.connect(uri).await?;
        match connection.create_channel().await {
            Ok(channel) => Ok(Self {
                id,
                connection,
                channel,
            }),
            Err(error) => {
                let mut cleanup = BestEffort::new("partial connection object");
                cleanup.run("close connection", connection.close()).await;
                let _ = cleanup.finish();
                Err(error)
            }
        }
    }

    /// Identifier unique within the issuing pool.
    #[must_use]
    pub fn id(&self) -> u64 { self.id }

    /// The operational channel.
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> { &self.channel }

    /// The underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn BrokerConnection> { &self.connection }

    /// Probe the connection and check the channel.
    ///
    /// # Errors
    ///
    /// Returns the first failing check.
    pub async fn validate(&self) -> Result<(), TransportError> {
        self.connection.probe().await?;
        self.channel.health_check().await
    }

    /// Close the channel and then the connection, attempting both.
    ///
    /// # Errors
    ///
    /// Returns a [`ShutdownError`] naming every step that failed.
    pub async fn destroy(&self) -> Result<(), ShutdownError> {
        let mut shutdown = BestEffort::new("connection object");
        shutdown.run("close channel", self.channel.close()).await;
        shutdown.run("close connection", self.connection.close()).await;
        shutdown.finish()
    }
}
