//! Broker transport seam.
//!
//! The bridge is generic over a narrow capability set: declare a queue,
//! publish, poll or block for deliveries, acknowledge or reject, and check
//! health. Backends implement [`TransportBackend`], [`BrokerConnection`] and
//! [`BrokerChannel`]; everything else (pooling, batching, lifecycle) is built
//! once on top of these traits.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    error::{ConfigError, TransportError},
    message::{Delivery, DeliveryTag, ReplyDestination},
};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;
pub mod registry;

pub use registry::BackendRegistry;

/// Persistence requested for a published message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Kept in memory only.
    #[default]
    Transient,
    /// Written to disk by brokers that support it.
    Persistent,
}

impl DeliveryMode {
    /// AMQP `delivery-mode` property value.
    #[must_use]
    pub const fn amqp_code(self) -> u8 {
        match self {
            Self::Transient => 1,
            Self::Persistent => 2,
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "transient" | "non-persistent" | "1" => Ok(Self::Transient),
            "persistent" | "2" => Ok(Self::Persistent),
            _ => Err(ConfigError::Invalid {
                key: "delivery_mode".into(),
                value: value.into(),
                reason: "expected transient or persistent".into(),
            }),
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Persistent => f.write_str("persistent"),
        }
    }
}

/// Attributes used when declaring a queue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueSpec {
    /// Survive broker restarts.
    pub durable: bool,
    /// Restrict the queue to the declaring connection.
    pub exclusive: bool,
    /// Delete the queue once its last consumer goes away.
    pub auto_delete: bool,
    /// Delete the queue after this much inactivity.
    pub expires: Option<Duration>,
    /// Discard messages older than this.
    pub message_ttl: Option<Duration>,
    /// High-availability policy name understood by the broker.
    pub ha_policy: Option<String>,
}

impl QueueSpec {
    /// Attributes of a reply queue that the broker removes after `expires`
    /// of inactivity.
    ///
    /// The queue is not exclusive: responders and extractors reach it
    /// through other connections, and it must outlive the declaring one.
    #[must_use]
    pub fn ephemeral(expires: Duration) -> Self {
        Self {
            durable: false,
            expires: Some(expires),
            ..Self::default()
        }
    }
}

/// Properties attached to a published message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishProperties {
    /// Where the receiver should publish its response.
    pub reply_to: Option<ReplyDestination>,
    /// Requested persistence.
    pub delivery_mode: DeliveryMode,
    /// Correlation identifier echoed back by responders.
    pub correlation_id: Option<String>,
}

/// A source of broker connections, selected by configuration.
#[async_trait]
pub trait TransportBackend: Send + Sync + 'static {
    /// Registry name of this backend.
    fn name(&self) -> &'static str;

    /// Open a connection to the broker identified by `uri`.
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

/// A live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open an operational channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    /// Lightweight liveness probe of the connection metadata.
    async fn probe(&self) -> Result<(), TransportError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), TransportError>;
}

/// An operational channel: the narrow capability set the bridge relies on.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare (or re-declare) a queue.
    async fn declare_queue(&self, queue: &str, spec: &QueueSpec) -> Result<(), TransportError>;

    /// Check that a queue exists without creating it.
    async fn queue_exists(&self, queue: &str) -> Result<bool, TransportError>;

    /// Limit the number of unacknowledged deliveries pushed to subscriptions.
    async fn set_prefetch(&self, limit: u16) -> Result<(), TransportError>;

    /// Publish `body` to `queue`.
    async fn publish(
        &self,
        queue: &str,
        body: Bytes,
        properties: &PublishProperties,
    ) -> Result<(), TransportError>;

    /// Fetch one delivery, waiting at most `wait`. Returns `None` when the
    /// queue stayed empty.
    async fn poll(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, TransportError>;

    /// Start a push subscription on `queue`.
    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn Subscription>, TransportError>;

    /// Acknowledge a delivery.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError>;

    /// Reject a delivery, optionally putting it back on its queue.
    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError>;

    /// Check that the channel is still usable.
    async fn health_check(&self) -> Result<(), TransportError>;

    /// Close the channel. Unacknowledged deliveries return to their queues.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A push subscription created by [`BrokerChannel::subscribe`].
#[async_trait]
pub trait Subscription: Send {
    /// Block until the next delivery arrives.
    ///
    /// Returns `Ok(None)` when the broker cancelled the subscription, for
    /// example because the queue was deleted. Implementations must be
    /// cancellation-safe: dropping a pending call loses no delivery.
    async fn recv(&mut self) -> Result<Option<Delivery>, TransportError>;
}
