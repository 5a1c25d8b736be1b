//! Consumer delegates installed by a [`ConnectionResource`].
//!
//! [`DefaultConsumer`] processes each delivery on its own: receive, process,
//! reply, acknowledge. [`MergingConsumer`] polls on a timer, accumulates
//! deliveries in a [`MessageAggregate`](crate::aggregate::MessageAggregate)
//! and hands whole batches to the engine.
//!
//! Both run until their shutdown token fires or the broker ends the
//! subscription, and report why they stopped as a [`ConsumerExit`].
//!
//! [`ConnectionResource`]: crate::resource::ConnectionResource

use std::{fmt, str::FromStr, sync::Arc};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::MergingConfig,
    error::{ConfigError, TransportError},
    message::{Delivery, Envelope, ReplyDestination},
    metrics::{self, ErrorKind},
    service::Callbacks,
    transport::{BrokerChannel, DeliveryMode, PublishProperties},
};

mod default;
mod merging;

pub use default::DefaultConsumer;
pub use merging::{MergingConsumer, TickOutcome};

/// Which delegate a resource installs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConsumerKind {
    /// Per-message receive loop.
    #[default]
    Default,
    /// Timer-driven batching consumer.
    Merging,
}

impl FromStr for ConsumerKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "merging" => Ok(Self::Merging),
            _ => Err(ConfigError::Invalid {
                key: "consumer".into(),
                value: value.into(),
                reason: "expected default or merging".into(),
            }),
        }
    }
}

impl fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Merging => f.write_str("merging"),
        }
    }
}

/// Everything a delegate needs to serve one subscription.
#[derive(Clone)]
pub struct ConsumerContext {
    /// Queue being consumed.
    pub queue: String,
    /// Consumer tag of the subscription.
    pub consumer_tag: String,
    /// Channel owned by the delegate for its whole run.
    pub channel: Arc<dyn BrokerChannel>,
    /// Engine and observer.
    pub callbacks: Callbacks,
    /// Stops the delegate at its next loop boundary.
    pub shutdown: CancellationToken,
}

impl fmt::Debug for ConsumerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerContext")
            .field("queue", &self.queue)
            .field("consumer_tag", &self.consumer_tag)
            .finish_non_exhaustive()
    }
}

impl ConsumerContext {
    /// Publish `response` to `reply_to`, echoing the request's correlation id.
    ///
    /// Failures are logged and counted, never raised: the request was
    /// processed and is acknowledged regardless.
    pub(crate) async fn publish_reply(
        &self,
        reply_to: &ReplyDestination,
        request: &Envelope,
        response: Bytes,
        delivery_mode: DeliveryMode,
    ) -> bool {
        let properties = PublishProperties {
            reply_to: None,
            delivery_mode,
            correlation_id: request.correlation_id.clone(),
        };
        match self.channel.publish(reply_to.as_str(), response, &properties).await {
            Ok(()) => {
                metrics::inc_replies();
                true
            }
            Err(error) => {
                metrics::inc_errors(ErrorKind::Reply);
                warn!(
                    queue = %self.queue,
                    reply_to = %reply_to,
                    %error,
                    "failed to publish reply"
                );
                false
            }
        }
    }

    /// Reject a delivery that can never be processed.
    pub(crate) async fn discard(&self, delivery: &Delivery) {
        let tag = delivery.envelope.delivery_tag;
        debug!(queue = %self.queue, delivery_tag = %tag, "discarding empty delivery");
        if let Err(error) = self.channel.reject(tag, false).await {
            metrics::inc_errors(ErrorKind::Ack);
            warn!(queue = %self.queue, delivery_tag = %tag, %error, "failed to reject delivery");
        }
    }
}

/// Why a delegate stopped.
#[derive(Debug)]
pub enum ConsumerExit {
    /// The shutdown token fired.
    Shutdown,
    /// The broker cancelled the subscription, for example because the queue
    /// was deleted.
    Cancelled,
    /// The channel failed.
    Failed(TransportError),
}

/// Run the delegate selected by `kind` until it exits.
pub(crate) async fn run(
    kind: ConsumerKind,
    context: ConsumerContext,
    merging: MergingConfig,
) -> ConsumerExit {
    match kind {
        ConsumerKind::Default => DefaultConsumer::new(context).run().await,
        ConsumerKind::Merging => MergingConsumer::new(context, merging).run().await,
    }
}
