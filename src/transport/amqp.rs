//! AMQP 0-9-1 backend built on `lapin`.
//!
//! Messages are published to the default exchange with the queue name as
//! routing key. Polling uses `basic.get`; subscriptions use `basic.consume`,
//! and the end of the consumer stream is reported as a broker cancellation.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::{
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    options::{
        BasicAckOptions,
        BasicConsumeOptions,
        BasicGetOptions,
        BasicPublishOptions,
        BasicQosOptions,
        BasicRejectOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use tokio::time::{Instant, sleep};

use super::{
    BrokerChannel,
    BrokerConnection,
    PublishProperties,
    QueueSpec,
    Subscription,
    TransportBackend,
};
use crate::{
    error::TransportError,
    message::{Delivery, DeliveryTag, Envelope, ReplyDestination},
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const REPLY_SUCCESS: u16 = 200;

/// Backend connecting to an AMQP broker such as RabbitMQ.
#[derive(Clone, Debug, Default)]
pub struct AmqpBackend;

#[async_trait]
impl TransportBackend for AmqpBackend {
    fn name(&self) -> &'static str { "amqp" }

    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|error| TransportError::Connect {
                uri: uri.to_owned(),
                source: Box::new(error),
            })?;
        Ok(Arc::new(AmqpConnection {
            connection: Arc::new(connection),
        }))
    }
}

struct AmqpConnection {
    connection: Arc<Connection>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|error| TransportError::io("create_channel", error))?;
        Ok(Arc::new(AmqpChannel {
            connection: Arc::clone(&self.connection),
            channel,
        }))
    }

    async fn probe(&self) -> Result<(), TransportError> {
        if self.connection.status().connected() {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed)
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|error| TransportError::io("close_connection", error))
    }
}

struct AmqpChannel {
    connection: Arc<Connection>,
    channel: Channel,
}

impl AmqpChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.channel.status().connected() {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed)
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &str, spec: &QueueSpec) -> Result<(), TransportError> {
        self.ensure_open()?;
        let options = QueueDeclareOptions {
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(queue, options, queue_arguments(spec))
            .await
            .map_err(|error| TransportError::io("queue_declare", error))?;
        Ok(())
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool, TransportError> {
        // A failed passive declare closes its channel, so probe on a
        // throwaway one.
        let probe = self
            .connection
            .create_channel()
            .await
            .map_err(|error| TransportError::io("create_channel", error))?;
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        let exists = match probe.queue_declare(queue, options, FieldTable::default()).await {
            Ok(_) => true,
            Err(lapin::Error::ProtocolError(error))
                if matches!(error.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)) =>
            {
                false
            }
            Err(error) => return Err(TransportError::io("queue_declare_passive", error)),
        };
        if probe.status().connected()
            && let Err(error) = probe.close(REPLY_SUCCESS, "OK").await
        {
            tracing::debug!(%error, "closing probe channel failed");
        }
        Ok(exists)
    }

    async fn set_prefetch(&self, limit: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(limit, BasicQosOptions::default())
            .await
            .map_err(|error| TransportError::io("basic_qos", error))
    }

    async fn publish(
        &self,
        queue: &str,
        body: Bytes,
        properties: &PublishProperties,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                basic_properties(properties),
            )
            .await
            .map_err(|error| TransportError::io("basic_publish", error))?
            .await
            .map_err(|error| TransportError::io("publisher_confirm", error))?;
        Ok(())
    }

    async fn poll(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + wait;
        loop {
            self.ensure_open()?;
            let fetched = self
                .channel
                .basic_get(queue, BasicGetOptions::default())
                .await
                .map_err(|error| not_found_or(queue, "basic_get", error))?;
            if let Some(message) = fetched {
                return Ok(Some(convert(message.delivery)));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|error| not_found_or(queue, "basic_consume", error))?;
        Ok(Box::new(AmqpSubscription { consumer }))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.channel
            .basic_ack(tag.get(), BasicAckOptions::default())
            .await
            .map_err(|error| TransportError::io("basic_ack", error))
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_reject(tag.get(), BasicRejectOptions { requeue })
            .await
            .map_err(|error| TransportError::io("basic_reject", error))
    }

    async fn health_check(&self) -> Result<(), TransportError> { self.ensure_open() }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|error| TransportError::io("close_channel", error))
    }
}

struct AmqpSubscription {
    consumer: lapin::Consumer,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn recv(&mut self) -> Result<Option<Delivery>, TransportError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(convert(delivery))),
            Some(Err(error)) => Err(TransportError::io("consume", error)),
            None => Ok(None),
        }
    }
}

fn not_found_or(queue: &str, operation: &'static str, error: lapin::Error) -> TransportError {
    match &error {
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)) =>
        {
            TransportError::QueueNotFound {
                queue: queue.to_owned(),
            }
        }
        _ => TransportError::io(operation, error),
    }
}

/// `x-` arguments carried by a queue declaration.
fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(expires) = spec.expires {
        arguments.insert(ShortString::from("x-expires"), AMQPValue::LongLongInt(millis(expires)));
    }
    if let Some(ttl) = spec.message_ttl {
        arguments.insert(ShortString::from("x-message-ttl"), AMQPValue::LongLongInt(millis(ttl)));
    }
    if let Some(policy) = &spec.ha_policy {
        arguments.insert(
            ShortString::from("x-ha-policy"),
            AMQPValue::LongString(LongString::from(policy.as_str())),
        );
    }
    arguments
}

fn millis(duration: Duration) -> i64 { i64::try_from(duration.as_millis()).unwrap_or(i64::MAX) }

fn basic_properties(properties: &PublishProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_delivery_mode(properties.delivery_mode.amqp_code());
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.as_str()));
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.as_str()));
    }
    basic
}

fn convert(delivery: lapin::message::Delivery) -> Delivery {
    let envelope = Envelope {
        delivery_tag: DeliveryTag::new(delivery.delivery_tag),
        reply_to: delivery
            .properties
            .reply_to()
            .as_ref()
            .map(|queue| ReplyDestination::from(queue.as_str())),
        correlation_id: delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_owned()),
        redelivered: delivery.redelivered,
    };
    Delivery::new(Bytes::from(delivery.data), envelope)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lapin::types::{AMQPValue, ShortString};

    use super::*;
    use crate::transport::DeliveryMode;

    #[test]
    fn queue_arguments_carry_expiry_and_ttl() {
        let spec = QueueSpec {
            expires: Some(Duration::from_secs(60)),
            message_ttl: Some(Duration::from_millis(1500)),
            ha_policy: Some("all".into()),
            ..QueueSpec::default()
        };

        let arguments = queue_arguments(&spec);
        let inner = arguments.inner();

        assert_eq!(
            inner.get(&ShortString::from("x-expires")),
            Some(&AMQPValue::LongLongInt(60_000))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongLongInt(1_500))
        );
        assert!(inner.contains_key(&ShortString::from("x-ha-policy")));
    }

    #[test]
    fn plain_queue_has_no_arguments() {
        assert!(queue_arguments(&QueueSpec::default()).inner().is_empty());
    }

    #[test]
    fn publish_properties_map_to_basic_properties() {
        let properties = PublishProperties {
            reply_to: Some(ReplyDestination::from("replies")),
            delivery_mode: DeliveryMode::Persistent,
            correlation_id: Some("42".into()),
        };

        let basic = basic_properties(&properties);

        assert_eq!(basic.delivery_mode(), &Some(2));
        assert_eq!(basic.reply_to().as_ref().map(ShortString::as_str), Some("replies"));
        assert_eq!(basic.correlation_id().as_ref().map(ShortString::as_str), Some("42"));
    }
}
