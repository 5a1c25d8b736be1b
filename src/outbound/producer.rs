//! Request publishing with optional reply waiting.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use bytes::Bytes;
use tokio::time::Instant;
use tracing::debug;

use super::settle;
use crate::{
    config::ProducerConfig,
    error::{BridgeError, ConfigError, Result, TransportError},
    message::ReplyDestination,
    pool::{ConnectionObject, ConnectionPool},
    transport::{BrokerChannel, DeliveryMode, PublishProperties, QueueSpec},
};

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

static NEXT_REPLY_QUEUE: AtomicU64 = AtomicU64::new(0);

/// Where the receiver should send its response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ReplyTo {
    /// No response is expected.
    #[default]
    None,
    /// An existing or caller-chosen queue.
    Named(ReplyDestination),
    /// A queue declared for this send that expires when unused.
    Ephemeral,
}

/// Per-send options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendAttributes {
    /// Reply destination to declare on the request.
    pub reply_to: ReplyTo,
    /// Block until a reply arrives or `read_timeout` elapses.
    pub wait_for_reply: bool,
    /// How long to wait for a reply.
    pub read_timeout: Duration,
    /// Bound on borrowing or opening a connection object.
    pub connect_timeout: Option<Duration>,
    /// Overrides the producer's default delivery mode.
    pub delivery_mode: Option<DeliveryMode>,
    /// Correlation identifier attached to the request.
    pub correlation_id: Option<String>,
}

impl Default for SendAttributes {
    fn default() -> Self {
        Self {
            reply_to: ReplyTo::None,
            wait_for_reply: false,
            read_timeout: DEFAULT_READ_TIMEOUT,
            connect_timeout: None,
            delivery_mode: None,
            correlation_id: None,
        }
    }
}

impl SendAttributes {
    /// Fire-and-forget send.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Request a reply on a private queue and wait up to `read_timeout`.
    #[must_use]
    pub fn request_reply(read_timeout: Duration) -> Self {
        Self {
            reply_to: ReplyTo::Ephemeral,
            wait_for_reply: true,
            read_timeout,
            ..Self::default()
        }
    }

    /// Set the reply destination.
    #[must_use]
    pub fn reply_to(mut self, reply_to: ReplyTo) -> Self {
        self.reply_to = reply_to;
        self
    }

    /// Override the delivery mode.
    #[must_use]
    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = Some(mode);
        self
    }

    /// Attach a correlation identifier.
    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Bound the borrow and connect step.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

/// What a send produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendOutcome {
    /// Reply destination declared on the request, if any.
    pub reply_to: Option<ReplyDestination>,
    /// Reply body, when the send waited for one.
    pub response: Option<Bytes>,
}

/// Publishes requests to one queue.
#[derive(Clone, Debug)]
pub struct Producer {
    pool: ConnectionPool,
    queue: String,
    defaults: ProducerConfig,
}

impl Producer {
    /// Producer for `queue` drawing connection objects from `pool`.
    #[must_use]
    pub fn new(pool: ConnectionPool, queue: impl Into<String>, defaults: ProducerConfig) -> Self {
        Self {
            pool,
            queue: queue.into(),
            defaults,
        }
    }

    /// Target queue.
    #[must_use]
    pub fn queue(&self) -> &str { &self.queue }

    /// Publish `body`, optionally waiting for the reply.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::QueueNotFound`] when the target queue does
    /// not exist, [`BridgeError::ReplyTimeout`] when no reply arrived in
    /// time, pool errors when no connection object is available, and any
    /// other broker failure.
    pub async fn send(&self, body: impl Into<Bytes>, attributes: &SendAttributes) -> Result<SendOutcome> {
        let lease = self.pool.borrow(attributes.connect_timeout).await?;
        let outcome = self.send_on(lease.object(), body.into(), attributes).await;
        settle(lease, outcome).await
    }

    async fn send_on(
        &self,
        object: &ConnectionObject,
        body: Bytes,
        attributes: &SendAttributes,
    ) -> Result<SendOutcome> {
        let channel = object.channel();
        if !channel.queue_exists(&self.queue).await? {
            return Err(TransportError::QueueNotFound {
                queue: self.queue.clone(),
            }
            .into());
        }
        let reply_to = self.prepare_reply(channel.as_ref(), &attributes.reply_to).await?;
        if attributes.wait_for_reply && reply_to.is_none() {
            return Err(ConfigError::Invalid {
                key: "reply_to".into(),
                value: "none".into(),
                reason: "waiting for a reply requires a reply destination".into(),
            }
            .into());
        }

        let properties = PublishProperties {
            reply_to: reply_to.clone(),
            delivery_mode: attributes.delivery_mode.unwrap_or(self.defaults.delivery_mode),
            correlation_id: attributes.correlation_id.clone(),
        };
        channel.publish(&self.queue, body, &properties).await?;
        debug!(queue = %self.queue, reply_to = ?reply_to, "request published");

        let response = match (&reply_to, attributes.wait_for_reply) {
            (Some(destination), true) => Some(
                await_reply(
                    channel.as_ref(),
                    destination,
                    attributes.correlation_id.as_deref(),
                    attributes.read_timeout,
                )
                .await?,
            ),
            _ => None,
        };
        Ok(SendOutcome { reply_to, response })
    }

    async fn prepare_reply(
        &self,
        channel: &dyn BrokerChannel,
        reply_to: &ReplyTo,
    ) -> Result<Option<ReplyDestination>> {
        let spec = QueueSpec::ephemeral(self.defaults.reply_expiry);
        match reply_to {
            ReplyTo::None => Ok(None),
            ReplyTo::Named(destination) => {
                if !channel.queue_exists(destination.as_str()).await? {
                    channel.declare_queue(destination.as_str(), &spec).await?;
                }
                Ok(Some(destination.clone()))
            }
            ReplyTo::Ephemeral => {
                let n = NEXT_REPLY_QUEUE.fetch_add(1, Ordering::Relaxed);
                let name = format!("queuebridge.reply.{}.{n}", std::process::id());
                channel.declare_queue(&name, &spec).await?;
                Ok(Some(ReplyDestination::new(name)))
            }
        }
    }
}

/// Poll `destination` until a matching reply arrives or `read_timeout`
/// elapses. Replies carrying a different correlation id are acknowledged
/// and skipped.
async fn await_reply(
    channel: &dyn BrokerChannel,
    destination: &ReplyDestination,
    correlation_id: Option<&str>,
    read_timeout: Duration,
) -> Result<Bytes> {
    let deadline = Instant::now() + read_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(BridgeError::ReplyTimeout(read_timeout));
        }
        let Some(delivery) = channel.poll(destination.as_str(), remaining).await? else {
            return Err(BridgeError::ReplyTimeout(read_timeout));
        };
        channel.ack(delivery.envelope.delivery_tag).await?;
        let stale = matches!(
            (correlation_id, delivery.envelope.correlation_id.as_deref()),
            (Some(expected), Some(actual)) if expected != actual
        );
        if stale {
            debug!(reply_to = %destination, "skipping reply for another request");
            continue;
        }
        return Ok(delivery.body);
    }
}
