//! Timer-driven batching consumer.
//!
//! The aggregate is owned by the consumer value, and the consumer is moved
//! into the single task that drives its timer. Nothing else can reach the
//! aggregate, so it needs no lock.

use bytes::Bytes;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use super::{ConsumerContext, ConsumerExit};
use crate::{
    aggregate::{Admission, MessageAggregate, ReplyGroup},
    config::MergingConfig,
    error::TransportError,
    format::Format,
    message::{Delivery, Message},
    metrics::{self, ErrorKind, Mode},
    service::{dispatch_merged, dispatch_one},
    shutdown::BestEffort,
};

/// Result of a single timer tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing is waiting in the aggregate.
    Idle,
    /// Messages are accumulated but no flush is due yet.
    Accumulating {
        /// Accepted messages waiting for the next flush.
        pending: usize,
    },
    /// A batch was processed and acknowledged.
    Flushed {
        /// Messages acknowledged.
        messages: usize,
        /// Engine invocations made.
        groups: usize,
    },
}

/// Consumer that coalesces deliveries into merged engine calls.
#[derive(Debug)]
pub struct MergingConsumer {
    context: ConsumerContext,
    config: MergingConfig,
    aggregate: MessageAggregate,
}

impl MergingConsumer {
    /// Create a consumer serving `context` with the given batching
    /// parameters.
    #[must_use]
    pub fn new(context: ConsumerContext, config: MergingConfig) -> Self {
        Self {
            context,
            config,
            aggregate: MessageAggregate::new(),
        }
    }

    /// Messages accumulated and not yet flushed.
    #[must_use]
    pub fn aggregate(&self) -> &MessageAggregate { &self.aggregate }

    /// Tick on the configured schedule until shutdown or cancellation.
    ///
    /// On the way out every message still held is rejected with requeue.
    pub async fn run(mut self) -> ConsumerExit {
        let start = Instant::now() + self.config.initial_delay;
        let mut ticker = interval_at(start, self.config.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            queue = %self.context.queue,
            consumer_tag = %self.context.consumer_tag,
            "merging consumer started"
        );

        let exit = loop {
            tokio::select! {
                biased;

                () = self.context.shutdown.cancelled() => break ConsumerExit::Shutdown,
                _ = ticker.tick() => {}
            }
            match self.tick().await {
                Ok(outcome) => {
                    if let TickOutcome::Flushed { messages, groups } = outcome {
                        debug!(queue = %self.context.queue, messages, groups, "flushed batch");
                    }
                }
                Err(error) if error.is_queue_missing() => {
                    warn!(
                        queue = %self.context.queue,
                        consumer_tag = %self.context.consumer_tag,
                        "queue disappeared; treating as broker cancellation"
                    );
                    break ConsumerExit::Cancelled;
                }
                Err(TransportError::ChannelClosed) => {
                    break ConsumerExit::Failed(TransportError::ChannelClosed);
                }
                Err(error) => {
                    metrics::inc_errors(ErrorKind::Transport);
                    warn!(queue = %self.context.queue, %error, "merging tick failed; retrying");
                }
            }
        };
        self.release_held().await;
        exit
    }

    /// Run one tick: poll until a flush is due or the queue is empty,
    /// requeue quarantined messages, and flush if due.
    ///
    /// # Errors
    ///
    /// Returns broker failures from polling or acknowledging. Accepted
    /// messages stay in the aggregate across a failed poll.
    pub async fn tick(&mut self) -> Result<TickOutcome, TransportError> {
        while !self.flush_due() {
            let polled = self
                .context
                .channel
                .poll(&self.context.queue, self.config.poll_timeout)
                .await?;
            match polled {
                Some(delivery) => self.accept(delivery).await,
                None => break,
            }
        }
        self.release_quarantined().await;

        if !self.flush_due() {
            return Ok(if self.aggregate.is_empty() {
                TickOutcome::Idle
            } else {
                TickOutcome::Accumulating {
                    pending: self.aggregate.len(),
                }
            });
        }
        self.flush().await
    }

    fn flush_due(&self) -> bool {
        self.aggregate
            .is_flush_due(self.config.min_batch, self.config.max_wait, Instant::now())
    }

    async fn accept(&mut self, delivery: Delivery) {
        if delivery.body.is_empty() {
            self.context.discard(&delivery).await;
            return;
        }
        let message = Message::from_delivery(delivery, Instant::now());
        match self.aggregate.add(message) {
            Ok(Admission::Accepted) => metrics::add_consumed(Mode::Merged, 1),
            Ok(Admission::Quarantined) => {}
            Err(error) => warn!(queue = %self.context.queue, %error, "message refused by aggregate"),
        }
    }

    async fn release_quarantined(&mut self) {
        let quarantined = self.aggregate.take_quarantined();
        if quarantined.is_empty() {
            return;
        }
        debug!(
            queue = %self.context.queue,
            count = quarantined.len(),
            "requeueing off-format messages"
        );
        metrics::add_quarantined(quarantined.len() as u64);
        self.requeue(&quarantined).await;
    }

    async fn flush(&mut self) -> Result<TickOutcome, TransportError> {
        let Some(format) = self.aggregate.format() else {
            return Ok(TickOutcome::Idle);
        };
        let groups = if self.config.merge_on_reply_to {
            self.aggregate.reply_groups()
        } else {
            vec![self.aggregate.single_group()]
        };
        for group in &groups {
            self.process_group(group, format).await;
        }
        let group_count = groups.len();
        drop(groups);
        metrics::inc_batches();

        let messages = self.aggregate.len();
        let acked = self.acknowledge_all().await;
        self.aggregate.reset();
        acked?;
        Ok(TickOutcome::Flushed {
            messages,
            groups: group_count,
        })
    }

    async fn process_group(&self, group: &ReplyGroup<'_>, format: Format) {
        let Some(first) = group.messages.first() else { return };
        let representative = first.body().clone();
        let result = if group.messages.len() == 1 {
            dispatch_one(&self.context.callbacks.service, representative.clone()).await
        } else {
            let requests: Vec<Bytes> = group.messages.iter().map(|m| m.body().clone()).collect();
            dispatch_merged(&self.context.callbacks.service, requests, format).await
        };
        let response = match result {
            Ok(response) => response,
            Err(error) => {
                metrics::inc_errors(ErrorKind::Processing);
                error!(
                    queue = %self.context.queue,
                    size = group.messages.len(),
                    %error,
                    "failed to process merged batch"
                );
                return;
            }
        };

        if let Some(reply_to) = group.reply_to {
            if !self.config.unity_only || group.messages.len() == 1 {
                self.context
                    .publish_reply(
                        reply_to,
                        first.envelope(),
                        response.clone(),
                        self.config.reply_delivery_mode,
                    )
                    .await;
            } else {
                debug!(reply_to = %reply_to, "multi-message group; reply suppressed");
            }
        }
        self.context.callbacks.observe(&representative, &response);
    }

    /// Acknowledge every accepted message in arrival order. A failed ack
    /// does not stop the pass; the failures are reported together.
    async fn acknowledge_all(&self) -> Result<(), TransportError> {
        let mut acks = BestEffort::new("batch acknowledgment");
        for message in self.aggregate.ordered() {
            let outcome = self.context.channel.ack(message.delivery_tag()).await;
            if outcome.is_err() {
                metrics::inc_errors(ErrorKind::Ack);
            }
            acks.record("ack", outcome);
        }
        acks.finish().map_err(|error| TransportError::io("ack", error))
    }

    async fn release_held(&mut self) {
        let held = self.aggregate.drain();
        if held.is_empty() {
            return;
        }
        debug!(queue = %self.context.queue, count = held.len(), "requeueing unflushed messages");
        self.requeue(&held).await;
    }

    async fn requeue(&self, messages: &[Message]) {
        for message in messages {
            let tag = message.delivery_tag();
            if let Err(error) = self.context.channel.reject(tag, true).await {
                metrics::inc_errors(ErrorKind::Ack);
                warn!(queue = %self.context.queue, delivery_tag = %tag, %error, "failed to requeue message");
            }
        }
    }
}
