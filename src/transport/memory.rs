//! In-process broker backend.
//!
//! `MemoryBroker` keeps named queues in memory and implements the full
//! transport seam: declare, publish, bounded poll, push subscriptions,
//! ack/reject and health probes. Unacknowledged deliveries return to their
//! queue when the channel that received them closes, and deleting a queue
//! cancels every subscription on it. A queue declared exclusive through a
//! channel belongs to that channel's connection: other connections are
//! refused, and the queue is deleted when its owner closes.
//!
//! The broker counts every operation and can inject faults, which makes it
//! the test double for pooling, batching and reconnection behaviour.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    sync::Notify,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;

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

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A message held by the in-memory broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    /// Payload bytes.
    pub body: Bytes,
    /// Properties supplied by the publisher.
    pub properties: PublishProperties,
    /// Whether the message was delivered before and returned to its queue.
    pub redelivered: bool,
}

/// Snapshot of broker activity counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Every call made through the transport seam, including connect attempts.
    pub operations: u64,
    /// Connection attempts, successful or not.
    pub connect_attempts: u64,
    /// Connections opened.
    pub connections_opened: u64,
    /// Connections closed.
    pub connections_closed: u64,
    /// Channels opened.
    pub channels_opened: u64,
    /// Channels closed, explicitly or with their connection.
    pub channels_closed: u64,
    /// Queue declarations.
    pub declares: u64,
    /// Messages published through a channel.
    pub publishes: u64,
    /// Deliveries acknowledged.
    pub acks: u64,
    /// Deliveries rejected.
    pub rejects: u64,
    /// Connection probes.
    pub probes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    operations: AtomicU64,
    connect_attempts: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    channels_opened: AtomicU64,
    channels_closed: AtomicU64,
    declares: AtomicU64,
    publishes: AtomicU64,
    acks: AtomicU64,
    rejects: AtomicU64,
    probes: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) { counter.fetch_add(1, Ordering::SeqCst); }

    fn snapshot(&self) -> BrokerStats {
        let read = |c: &AtomicU64| c.load(Ordering::SeqCst);
        BrokerStats {
            operations: read(&self.operations),
            connect_attempts: read(&self.connect_attempts),
            connections_opened: read(&self.connections_opened),
            connections_closed: read(&self.connections_closed),
            channels_opened: read(&self.channels_opened),
            channels_closed: read(&self.channels_closed),
            declares: read(&self.declares),
            publishes: read(&self.publishes),
            acks: read(&self.acks),
            rejects: read(&self.rejects),
            probes: read(&self.probes),
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    connect: usize,
    declare: usize,
    probe: usize,
    publish: usize,
    poll: usize,
}

impl Faults {
    fn take(slot: &mut usize) -> bool {
        if *slot == 0 {
            return false;
        }
        *slot -= 1;
        true
    }
}

#[derive(Debug)]
struct MemoryQueue {
    spec: QueueSpec,
    owner: Option<u64>,
    ready: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
    deleted: CancellationToken,
}

impl MemoryQueue {
    fn new(spec: QueueSpec, owner: Option<u64>) -> Self {
        Self {
            spec,
            owner,
            ready: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            deleted: CancellationToken::new(),
        }
    }

    fn push_back(&self, message: StoredMessage) {
        lock(&self.ready).push_back(message);
        self.notify.notify_waiters();
    }

    fn push_front(&self, message: StoredMessage) {
        lock(&self.ready).push_front(message);
        self.notify.notify_waiters();
    }

    fn pop(&self) -> Option<StoredMessage> { lock(&self.ready).pop_front() }
}

#[derive(Debug)]
struct Unacked {
    queue: Arc<MemoryQueue>,
    channel: u64,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: DashMap<String, Arc<MemoryQueue>>,
    unacked: DashMap<u64, Unacked>,
    next_tag: AtomicU64,
    next_id: AtomicU64,
    last_prefetch: AtomicU16,
    counters: Counters,
    faults: Mutex<Faults>,
}

impl BrokerState {
    fn op(&self) { Counters::bump(&self.counters.operations); }

    fn next_id(&self) -> u64 { self.next_id.fetch_add(1, Ordering::SeqCst) + 1 }

    fn queue(&self, name: &str) -> Result<Arc<MemoryQueue>, TransportError> {
        self.queues
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::QueueNotFound { queue: name.into() })
    }

    /// Look up `name` on behalf of `connection`, refusing exclusive queues
    /// owned by another connection.
    fn open_queue(
        &self,
        name: &str,
        connection: u64,
        operation: &'static str,
    ) -> Result<Arc<MemoryQueue>, TransportError> {
        let queue = self.queue(name)?;
        match queue.owner {
            Some(owner) if owner != connection => Err(TransportError::io(
                operation,
                format!("queue {name} is exclusive to another connection"),
            )),
            _ => Ok(queue),
        }
    }

    fn remove_queue(&self, name: &str) -> bool {
        let Some((_, removed)) = self.queues.remove(name) else {
            return false;
        };
        removed.deleted.cancel();
        self.unacked
            .retain(|_, unacked| !Arc::ptr_eq(&unacked.queue, &removed));
        true
    }

    fn remove_owned_by(&self, connection: u64) {
        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|entry| entry.value().owner == Some(connection))
            .map(|entry| entry.key().clone())
            .collect();
        for name in owned {
            self.remove_queue(&name);
        }
    }

    fn fault(&self, pick: impl FnOnce(&mut Faults) -> &mut usize) -> bool {
        let mut faults = lock(&self.faults);
        Faults::take(pick(&mut faults))
    }

    fn deliver(&self, queue: &Arc<MemoryQueue>, channel: u64, message: StoredMessage) -> Delivery {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let delivery = Delivery::new(
            message.body.clone(),
            Envelope {
                delivery_tag: DeliveryTag::new(tag),
                reply_to: message.properties.reply_to.clone(),
                correlation_id: message.properties.correlation_id.clone(),
                redelivered: message.redelivered,
            },
        );
        self.unacked.insert(
            tag,
            Unacked {
                queue: Arc::clone(queue),
                channel,
                message,
            },
        );
        delivery
    }

    fn requeue_channel(&self, channel: u64) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|entry| entry.value().channel == channel)
            .map(|entry| *entry.key())
            .collect();
        for tag in tags {
            if let Some((_, unacked)) = self.unacked.remove(&tag) {
                requeue(unacked);
            }
        }
    }
}

fn requeue(unacked: Unacked) {
    if unacked.queue.deleted.is_cancelled() {
        return;
    }
    let mut message = unacked.message;
    message.redelivered = true;
    unacked.queue.push_front(message);
}

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Backend handle connecting to this broker.
    #[must_use]
    pub fn backend(&self) -> MemoryBackend { MemoryBackend::new(self.clone()) }

    /// Declare a queue directly, bypassing connection accounting. The queue
    /// has no owning connection even if `spec` is exclusive.
    pub fn declare(&self, queue: &str, spec: QueueSpec) {
        self.state
            .queues
            .entry(queue.to_owned())
            .or_insert_with(|| Arc::new(MemoryQueue::new(spec, None)));
    }

    /// Enqueue a message directly, as an external producer would.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::QueueNotFound`] if the queue does not exist.
    pub fn enqueue(
        &self,
        queue: &str,
        body: impl Into<Bytes>,
        reply_to: Option<&str>,
    ) -> Result<(), TransportError> {
        let target = self.state.queue(queue)?;
        target.push_back(StoredMessage {
            body: body.into(),
            properties: PublishProperties {
                reply_to: reply_to.map(ReplyDestination::from),
                ..PublishProperties::default()
            },
            redelivered: false,
        });
        Ok(())
    }

    /// Remove and return every ready message on `queue`.
    #[must_use]
    pub fn take(&self, queue: &str) -> Vec<StoredMessage> {
        self.state
            .queue(queue)
            .map(|q| lock(&q.ready).drain(..).collect())
            .unwrap_or_default()
    }

    /// Number of ready messages on `queue`, or `None` if it does not exist.
    #[must_use]
    pub fn depth(&self, queue: &str) -> Option<usize> {
        self.state.queue(queue).ok().map(|q| lock(&q.ready).len())
    }

    /// Most recent prefetch limit applied by any channel.
    #[must_use]
    pub fn last_prefetch(&self) -> Option<u16> {
        match self.state.last_prefetch.load(Ordering::SeqCst) {
            0 => None,
            limit => Some(limit),
        }
    }

    /// Number of deliveries awaiting acknowledgment.
    #[must_use]
    pub fn unacked(&self) -> usize { self.state.unacked.len() }

    /// Returns true if `queue` exists.
    #[must_use]
    pub fn has_queue(&self, queue: &str) -> bool { self.state.queues.contains_key(queue) }

    /// Attributes `queue` was declared with.
    #[must_use]
    pub fn queue_spec(&self, queue: &str) -> Option<QueueSpec> {
        self.state.queue(queue).ok().map(|q| q.spec.clone())
    }

    /// Delete `queue`, cancelling every subscription on it.
    ///
    /// Returns true if the queue existed.
    pub fn delete_queue(&self, queue: &str) -> bool { self.state.remove_queue(queue) }

    /// Snapshot of the activity counters.
    #[must_use]
    pub fn stats(&self) -> BrokerStats { self.state.counters.snapshot() }

    /// Connections currently open.
    #[must_use]
    pub fn open_connections(&self) -> u64 {
        let stats = self.stats();
        stats.connections_opened - stats.connections_closed
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: usize) { lock(&self.state.faults).connect = n; }

    /// Fail the next `n` queue declarations.
    pub fn fail_next_declares(&self, n: usize) { lock(&self.state.faults).declare = n; }

    /// Fail the next `n` connection probes.
    pub fn fail_next_probes(&self, n: usize) { lock(&self.state.faults).probe = n; }

    /// Fail the next `n` publishes.
    pub fn fail_next_publishes(&self, n: usize) { lock(&self.state.faults).publish = n; }

    /// Fail the next `n` polls.
    pub fn fail_next_polls(&self, n: usize) { lock(&self.state.faults).poll = n; }
}

/// [`TransportBackend`] connecting to a [`MemoryBroker`].
///
/// The connection URI is accepted for symmetry with networked backends and
/// otherwise ignored.
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    broker: MemoryBroker,
}

impl MemoryBackend {
    /// Backend for `broker`.
    #[must_use]
    pub fn new(broker: MemoryBroker) -> Self { Self { broker } }

    /// The broker this backend connects to.
    #[must_use]
    pub fn broker(&self) -> &MemoryBroker { &self.broker }
}

#[async_trait]
impl TransportBackend for MemoryBackend {
    fn name(&self) -> &'static str { "memory" }

    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let state = &self.broker.state;
        state.op();
        Counters::bump(&state.counters.connect_attempts);
        if state.fault(|f| &mut f.connect) {
            return Err(TransportError::Connect {
                uri: uri.into(),
                source: "injected connect failure".into(),
            });
        }
        Counters::bump(&state.counters.connections_opened);
        Ok(Arc::new(MemoryConnection {
            id: state.next_id(),
            state: Arc::clone(state),
            closed: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
        }))
    }
}

#[derive(Debug)]
struct ChannelShared {
    id: u64,
    connection: u64,
    closed: AtomicBool,
}

impl ChannelShared {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        Ok(())
    }

    /// Mark closed; returns true if this call performed the transition.
    fn mark_closed(&self) -> bool { !self.closed.swap(true, Ordering::SeqCst) }
}

struct MemoryConnection {
    id: u64,
    state: Arc<BrokerState>,
    closed: AtomicBool,
    channels: Mutex<Vec<Arc<ChannelShared>>>,
}

fn close_channel(state: &BrokerState, shared: &ChannelShared) {
    if shared.mark_closed() {
        Counters::bump(&state.counters.channels_closed);
        state.requeue_channel(shared.id);
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        self.state.op();
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        let shared = Arc::new(ChannelShared {
            id: self.state.next_id(),
            connection: self.id,
            closed: AtomicBool::new(false),
        });
        lock(&self.channels).push(Arc::clone(&shared));
        Counters::bump(&self.state.counters.channels_opened);
        Ok(Arc::new(MemoryChannel {
            state: Arc::clone(&self.state),
            shared,
        }))
    }

    async fn probe(&self) -> Result<(), TransportError> {
        self.state.op();
        Counters::bump(&self.state.counters.probes);
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        if self.state.fault(|f| &mut f.probe) {
            return Err(TransportError::Injected { operation: "probe" });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.op();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let channels = std::mem::take(&mut *lock(&self.channels));
        for shared in &channels {
            close_channel(&self.state, shared);
        }
        self.state.remove_owned_by(self.id);
        Counters::bump(&self.state.counters.connections_closed);
        Ok(())
    }
}

struct MemoryChannel {
    state: Arc<BrokerState>,
    shared: Arc<ChannelShared>,
}

impl MemoryChannel {
    fn enter(&self) -> Result<(), TransportError> {
        self.state.op();
        self.shared.ensure_open()
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, queue: &str, spec: &QueueSpec) -> Result<(), TransportError> {
        self.enter()?;
        Counters::bump(&self.state.counters.declares);
        if self.state.fault(|f| &mut f.declare) {
            return Err(TransportError::Injected {
                operation: "declare",
            });
        }
        if self.state.queues.contains_key(queue) {
            self.state.open_queue(queue, self.shared.connection, "declare")?;
            return Ok(());
        }
        let owner = spec.exclusive.then_some(self.shared.connection);
        self.state
            .queues
            .entry(queue.to_owned())
            .or_insert_with(|| Arc::new(MemoryQueue::new(spec.clone(), owner)));
        Ok(())
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool, TransportError> {
        self.enter()?;
        if !self.state.queues.contains_key(queue) {
            return Ok(false);
        }
        self.state.open_queue(queue, self.shared.connection, "declare_passive")?;
        Ok(true)
    }

    async fn set_prefetch(&self, limit: u16) -> Result<(), TransportError> {
        self.enter()?;
        self.state.last_prefetch.store(limit, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: Bytes,
        properties: &PublishProperties,
    ) -> Result<(), TransportError> {
        self.enter()?;
        if self.state.fault(|f| &mut f.publish) {
            return Err(TransportError::Injected {
                operation: "publish",
            });
        }
        let target = self.state.open_queue(queue, self.shared.connection, "publish")?;
        Counters::bump(&self.state.counters.publishes);
        target.push_back(StoredMessage {
            body,
            properties: properties.clone(),
            redelivered: false,
        });
        Ok(())
    }

    async fn poll(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        self.enter()?;
        if self.state.fault(|f| &mut f.poll) {
            return Err(TransportError::Injected { operation: "poll" });
        }
        let source = self.state.open_queue(queue, self.shared.connection, "poll")?;
        let deadline = Instant::now() + wait;
        loop {
            let notified = source.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.shared.ensure_open()?;
            if let Some(message) = source.pop() {
                return Ok(Some(self.state.deliver(&source, self.shared.id, message)));
            }
            if source.deleted.is_cancelled() {
                return Err(TransportError::QueueNotFound { queue: queue.into() });
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                () = &mut notified => {}
                () = source.deleted.cancelled() => {}
                () = sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn subscribe(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        self.enter()?;
        let source = self.state.open_queue(queue, self.shared.connection, "subscribe")?;
        Ok(Box::new(MemorySubscription {
            state: Arc::clone(&self.state),
            shared: Arc::clone(&self.shared),
            queue: source,
        }))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.enter()?;
        match self.state.unacked.remove(&tag.get()) {
            Some(_) => {
                Counters::bump(&self.state.counters.acks);
                Ok(())
            }
            None => Err(TransportError::io("ack", format!("unknown delivery tag {tag}"))),
        }
    }

    async fn reject(&self, tag: DeliveryTag, requeue_message: bool) -> Result<(), TransportError> {
        self.enter()?;
        let Some((_, unacked)) = self.state.unacked.remove(&tag.get()) else {
            return Err(TransportError::io(
                "reject",
                format!("unknown delivery tag {tag}"),
            ));
        };
        Counters::bump(&self.state.counters.rejects);
        if requeue_message {
            requeue(unacked);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), TransportError> { self.enter() }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.op();
        close_channel(&self.state, &self.shared);
        Ok(())
    }
}

struct MemorySubscription {
    state: Arc<BrokerState>,
    shared: Arc<ChannelShared>,
    queue: Arc<MemoryQueue>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Result<Option<Delivery>, TransportError> {
        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.queue.deleted.is_cancelled() {
                return Ok(None);
            }
            self.shared.ensure_open()?;
            if let Some(message) = self.queue.pop() {
                return Ok(Some(self.state.deliver(&self.queue, self.shared.id, message)));
            }
            tokio::select! {
                () = &mut notified => {}
                () = self.queue.deleted.cancelled() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.declare("work", QueueSpec::default());
        broker
    }

    async fn channel(broker: &MemoryBroker) -> (Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>) {
        let connection = broker.backend().connect("memory://").await.expect("connect");
        let channel = connection.create_channel().await.expect("channel");
        (connection, channel)
    }

    #[rstest]
    #[tokio::test]
    async fn poll_returns_none_when_empty(broker: MemoryBroker) {
        let (_conn, channel) = channel(&broker).await;
        let polled = channel
            .poll("work", Duration::from_millis(5))
            .await
            .expect("poll");
        assert!(polled.is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn unacked_deliveries_return_when_channel_closes(broker: MemoryBroker) {
        broker.enqueue("work", &b"{}"[..], Some("replies")).expect("enqueue");
        let (_conn, channel) = channel(&broker).await;
        let delivery = channel
            .poll("work", Duration::ZERO)
            .await
            .expect("poll")
            .expect("message available");
        assert_eq!(delivery.envelope.reply_to.as_ref().map(ReplyDestination::as_str), Some("replies"));
        assert_eq!(broker.depth("work"), Some(0));
        assert_eq!(broker.unacked(), 1);

        channel.close().await.expect("close channel");

        assert_eq!(broker.depth("work"), Some(1));
        assert_eq!(broker.unacked(), 0);
        let redelivered = broker.take("work");
        assert!(redelivered[0].redelivered);
    }

    #[rstest]
    #[tokio::test]
    async fn reject_with_requeue_puts_message_back_first(broker: MemoryBroker) {
        broker.enqueue("work", &b"first"[..], None).expect("enqueue");
        broker.enqueue("work", &b"second"[..], None).expect("enqueue");
        let (_conn, channel) = channel(&broker).await;
        let first = channel
            .poll("work", Duration::ZERO)
            .await
            .expect("poll")
            .expect("first");
        channel
            .reject(first.envelope.delivery_tag, true)
            .await
            .expect("reject");

        let again = channel
            .poll("work", Duration::ZERO)
            .await
            .expect("poll")
            .expect("requeued");
        assert_eq!(again.body, Bytes::from_static(b"first"));
        assert!(again.envelope.redelivered);
    }

    #[rstest]
    #[tokio::test]
    async fn deleting_a_queue_cancels_subscriptions(broker: MemoryBroker) {
        let (_conn, channel) = channel(&broker).await;
        let mut subscription = channel.subscribe("work", "tag").await.expect("subscribe");
        let waiter = tokio::spawn(async move { subscription.recv().await });
        tokio::task::yield_now().await;

        assert!(broker.delete_queue("work"));

        let outcome = waiter.await.expect("join").expect("recv");
        assert!(outcome.is_none(), "cancellation is reported as end of stream");
    }

    #[rstest]
    #[tokio::test]
    async fn subscription_wakes_on_publish(broker: MemoryBroker) {
        let (_conn, channel) = channel(&broker).await;
        let mut subscription = channel.subscribe("work", "tag").await.expect("subscribe");
        let waiter = tokio::spawn(async move { subscription.recv().await });
        tokio::task::yield_now().await;

        channel
            .publish("work", Bytes::from_static(b"{}"), &PublishProperties::default())
            .await
            .expect("publish");

        let delivery = waiter.await.expect("join").expect("recv").expect("delivery");
        assert_eq!(delivery.body, Bytes::from_static(b"{}"));
    }

    #[rstest]
    #[tokio::test]
    async fn publish_to_missing_queue_fails(broker: MemoryBroker) {
        let (_conn, channel) = channel(&broker).await;
        let err = channel
            .publish("nowhere", Bytes::from_static(b"{}"), &PublishProperties::default())
            .await
            .expect_err("missing queue");
        assert!(err.is_queue_missing());
    }

    #[rstest]
    #[tokio::test]
    async fn injected_faults_are_consumed(broker: MemoryBroker) {
        broker.fail_next_probes(1);
        let (connection, _channel) = channel(&broker).await;
        assert!(connection.probe().await.is_err());
        assert!(connection.probe().await.is_ok());
    }

    #[rstest]
    #[tokio::test]
    async fn closing_a_connection_closes_its_channels(broker: MemoryBroker) {
        let (connection, channel) = channel(&broker).await;
        connection.close().await.expect("close");
        assert!(channel.health_check().await.is_err());
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(broker.stats().channels_closed, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn exclusive_queue_belongs_to_its_connection(broker: MemoryBroker) {
        let (owner, owner_channel) = channel(&broker).await;
        let (_other, other_channel) = channel(&broker).await;
        let exclusive = QueueSpec {
            exclusive: true,
            ..QueueSpec::default()
        };
        owner_channel
            .declare_queue("private", &exclusive)
            .await
            .expect("declare");

        let refused = other_channel
            .publish("private", Bytes::from_static(b"{}"), &PublishProperties::default())
            .await
            .expect_err("owned by another connection");
        assert!(!refused.is_queue_missing());
        assert!(other_channel.poll("private", Duration::ZERO).await.is_err());
        owner_channel
            .publish("private", Bytes::from_static(b"{}"), &PublishProperties::default())
            .await
            .expect("owner may publish");

        owner.close().await.expect("close");
        assert!(!broker.has_queue("private"));
        assert!(broker.has_queue("work"));
    }
}
