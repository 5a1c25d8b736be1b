//! Per-message consumer.

use tracing::{debug, error, info, warn};

use super::{ConsumerContext, ConsumerExit};
use crate::{
    message::Delivery,
    metrics::{self, ErrorKind, Mode},
    service::dispatch_one,
    transport::DeliveryMode,
};

/// Receive loop handling one delivery at a time.
///
/// Each delivery is processed, its response published to the declared reply
/// destination (and dropped when none was declared), the observer notified,
/// and the delivery acknowledged. Acknowledgment happens whether or not
/// processing succeeded, so a poisoned message never blocks the queue.
#[derive(Debug)]
pub struct DefaultConsumer {
    context: ConsumerContext,
}

impl DefaultConsumer {
    /// Create a consumer serving `context`.
    #[must_use]
    pub fn new(context: ConsumerContext) -> Self { Self { context } }

    /// Subscribe and process deliveries until shutdown or cancellation.
    pub async fn run(self) -> ConsumerExit {
        let ctx = &self.context;
        let mut subscription = match ctx.channel.subscribe(&ctx.queue, &ctx.consumer_tag).await {
            Ok(subscription) => subscription,
            Err(error) if error.is_queue_missing() => return ConsumerExit::Cancelled,
            Err(error) => return ConsumerExit::Failed(error),
        };
        info!(queue = %ctx.queue, consumer_tag = %ctx.consumer_tag, "default consumer started");

        loop {
            let next = tokio::select! {
                biased;

                () = ctx.shutdown.cancelled() => return ConsumerExit::Shutdown,
                next = subscription.recv() => next,
            };
            match next {
                Ok(Some(delivery)) => self.handle(delivery).await,
                Ok(None) => {
                    warn!(
                        queue = %ctx.queue,
                        consumer_tag = %ctx.consumer_tag,
                        "subscription cancelled by broker"
                    );
                    return ConsumerExit::Cancelled;
                }
                Err(error) => return ConsumerExit::Failed(error),
            }
        }
    }

    /// Process, reply to and acknowledge one delivery.
    pub async fn handle(&self, delivery: Delivery) {
        let ctx = &self.context;
        if delivery.body.is_empty() {
            ctx.discard(&delivery).await;
            return;
        }
        metrics::add_consumed(Mode::Single, 1);

        let Delivery { body, envelope } = delivery;
        let tag = envelope.delivery_tag;
        match dispatch_one(&ctx.callbacks.service, body.clone()).await {
            Ok(response) => {
                match &envelope.reply_to {
                    Some(reply_to) => {
                        ctx.publish_reply(reply_to, &envelope, response.clone(), DeliveryMode::Transient)
                            .await;
                    }
                    None => debug!(delivery_tag = %tag, "no reply destination; response dropped"),
                }
                ctx.callbacks.observe(&body, &response);
            }
            Err(error) => {
                metrics::inc_errors(ErrorKind::Processing);
                error!(queue = %ctx.queue, delivery_tag = %tag, %error, "failed to process message");
            }
        }

        if let Err(error) = ctx.channel.ack(tag).await {
            metrics::inc_errors(ErrorKind::Ack);
            warn!(queue = %ctx.queue, delivery_tag = %tag, %error, "failed to acknowledge message");
        }
    }
}
