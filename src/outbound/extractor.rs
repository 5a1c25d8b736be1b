//! Non-blocking fetch of one message.

use std::time::Duration;

use tokio::time::Instant;

use super::settle;
use crate::{
    error::Result,
    message::Message,
    pool::{ConnectionObject, ConnectionPool},
};

/// Per-receive options.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceiveAttributes {
    /// Queue to read; defaults to the extractor's queue.
    pub queue: Option<String>,
    /// Bound on borrowing or opening a connection object.
    pub connect_timeout: Option<Duration>,
}

impl ReceiveAttributes {
    /// Read from `queue` instead of the extractor's default.
    #[must_use]
    pub fn from_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..Self::default()
        }
    }
}

/// Fetches single messages, acknowledging each on retrieval.
#[derive(Clone, Debug)]
pub struct Extractor {
    pool: ConnectionPool,
    queue: String,
}

impl Extractor {
    /// Extractor reading `queue` through `pool`.
    #[must_use]
    pub fn new(pool: ConnectionPool, queue: impl Into<String>) -> Self {
        Self {
            pool,
            queue: queue.into(),
        }
    }

    /// Take one available message, or `None` when the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns pool errors and broker failures. An empty queue is not an
    /// error.
    pub async fn receive(&self, attributes: &ReceiveAttributes) -> Result<Option<Message>> {
        let queue = attributes.queue.as_deref().unwrap_or(&self.queue);
        let lease = self.pool.borrow(attributes.connect_timeout).await?;
        let outcome = fetch(lease.object(), queue).await;
        settle(lease, outcome).await
    }
}

async fn fetch(object: &ConnectionObject, queue: &str) -> Result<Option<Message>> {
    let channel = object.channel();
    let Some(delivery) = channel.poll(queue, Duration::ZERO).await? else {
        return Ok(None);
    };
    channel.ack(delivery.envelope.delivery_tag).await?;
    Ok(Some(Message::from_delivery(delivery, Instant::now())))
}
