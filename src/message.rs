//! Inbound message values.
//!
//! A [`Message`] is created when the broker hands over a delivery and stays
//! immutable until it is acknowledged or rejected. The broker-native
//! properties are kept in an [`Envelope`]; the bridge only ever reads the
//! reply destination and the delivery tag from it.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use tokio::time::Instant;

use crate::format::Format;

/// Broker-assigned identifier used to acknowledge or reject a delivery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    /// Create a tag from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self { Self(raw) }

    /// Return the raw tag value.
    #[must_use]
    pub const fn get(self) -> u64 { self.0 }
}

impl From<u64> for DeliveryTag {
    fn from(value: u64) -> Self { Self(value) }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Queue identifier to which a computed response is published.
///
/// Cheap to clone and usable as a map key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplyDestination(Arc<str>);

impl ReplyDestination {
    /// Wrap a queue name.
    pub fn new(queue: impl Into<Arc<str>>) -> Self { Self(queue.into()) }

    /// Queue name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<&str> for ReplyDestination {
    fn from(value: &str) -> Self { Self::new(value) }
}

impl From<String> for ReplyDestination {
    fn from(value: String) -> Self { Self::new(value) }
}

impl fmt::Display for ReplyDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Broker-native properties of a delivery.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Tag used for acknowledgment.
    pub delivery_tag: DeliveryTag,
    /// Declared reply destination, if the sender asked for a response.
    pub reply_to: Option<ReplyDestination>,
    /// Correlation identifier set by the sender.
    pub correlation_id: Option<String>,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
}

/// Raw delivery handed over by a broker backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Payload bytes.
    pub body: Bytes,
    /// Broker-native properties.
    pub envelope: Envelope,
}

impl Delivery {
    /// Convenience constructor used by backends.
    #[must_use]
    pub fn new(body: Bytes, envelope: Envelope) -> Self { Self { body, envelope } }
}

/// An inbound message awaiting processing.
#[derive(Clone, Debug)]
pub struct Message {
    body: Bytes,
    envelope: Envelope,
    arrived_at: Instant,
}

impl Message {
    /// Build a message from its parts.
    #[must_use]
    pub fn new(body: Bytes, envelope: Envelope, arrived_at: Instant) -> Self {
        Self {
            body,
            envelope,
            arrived_at,
        }
    }

    /// Stamp a broker delivery with its arrival time.
    #[must_use]
    pub fn from_delivery(delivery: Delivery, arrived_at: Instant) -> Self {
        Self::new(delivery.body, delivery.envelope, arrived_at)
    }

    /// Payload bytes.
    #[must_use]
    pub fn body(&self) -> &Bytes { &self.body }

    /// Leading discriminant byte of the payload, if any.
    #[must_use]
    pub fn discriminant(&self) -> Option<u8> { self.body.first().copied() }

    /// Encoding family announced by the payload.
    #[must_use]
    pub fn format(&self) -> Option<Format> { Format::of(&self.body) }

    /// Declared reply destination.
    #[must_use]
    pub fn reply_destination(&self) -> Option<&ReplyDestination> { self.envelope.reply_to.as_ref() }

    /// Tag used to acknowledge this message.
    #[must_use]
    pub fn delivery_tag(&self) -> DeliveryTag { self.envelope.delivery_tag }

    /// Broker-native properties.
    #[must_use]
    pub fn envelope(&self) -> &Envelope { &self.envelope }

    /// Time the message was received from the broker.
    #[must_use]
    pub fn arrived_at(&self) -> Instant { self.arrived_at }
}
