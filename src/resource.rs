//! Lifecycle of one subscription.
//!
//! A [`ConnectionResource`] owns a connection object, declares its queue,
//! and runs one consumer delegate on a background task. It reconnects when
//! the broker cancels the subscription (if configured to), repairs itself
//! from health checks, and stops for good once destroyed.
//!
//! Connect, close and reconnect all run under one async mutex, so no caller
//! ever observes a half torn down resource.

use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        Mutex as StdMutex,
        PoisonError,
        Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use futures::FutureExt;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    config::BridgeConfig,
    consumer::{self, ConsumerContext, ConsumerExit},
    error::{Result, TransportError},
    metrics,
    panic::format_panic,
    pool::ConnectionObject,
    service::Callbacks,
    shutdown::{BestEffort, ShutdownError},
    transport::TransportBackend,
};

/// Observable lifecycle phase of a [`ConnectionResource`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourcePhase {
    /// Never connected.
    Unconnected,
    /// Connected with a running delegate.
    Connected,
    /// The broker cancelled the subscription and no recovery ran.
    Cancelled,
    /// Tearing down and connecting again.
    Reconnecting,
    /// Closed; may connect again.
    Closed,
    /// Destroyed; every further lifecycle call is a no-op.
    Destroyed,
}

struct Session {
    object: ConnectionObject,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ResourceState {
    session: Option<Session>,
    generation: u64,
}

struct ResourceInner {
    backend: Arc<dyn TransportBackend>,
    config: Arc<BridgeConfig>,
    consumer_tag: String,
    callbacks: Callbacks,
    tracker: TaskTracker,
    killed: AtomicBool,
    phase: StdMutex<ResourcePhase>,
    state: Mutex<ResourceState>,
    next_object: AtomicU64,
    reconnects: AtomicU64,
}

impl ResourceInner {
    fn set_phase(&self, phase: ResourcePhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    fn phase(&self) -> ResourcePhase { *self.phase.lock().unwrap_or_else(PoisonError::into_inner) }
}

/// One subscription on the configured queue.
#[derive(Clone)]
pub struct ConnectionResource {
    inner: Arc<ResourceInner>,
}

impl fmt::Debug for ConnectionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionResource")
            .field("queue", &self.inner.config.queue)
            .field("consumer_tag", &self.inner.consumer_tag)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl ConnectionResource {
    /// Create an unconnected resource for instance `index` of `config`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn TransportBackend>,
        config: Arc<BridgeConfig>,
        index: usize,
        callbacks: Callbacks,
    ) -> Self {
        let consumer_tag = config.consumer_tag(index);
        Self {
            inner: Arc::new(ResourceInner {
                backend,
                config,
                consumer_tag,
                callbacks,
                tracker: TaskTracker::new(),
                killed: AtomicBool::new(false),
                phase: StdMutex::new(ResourcePhase::Unconnected),
                state: Mutex::new(ResourceState::default()),
                next_object: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
            }),
        }
    }

    /// Consumer tag of the subscription.
    #[must_use]
    pub fn consumer_tag(&self) -> &str { &self.inner.consumer_tag }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> ResourcePhase { self.inner.phase() }

    /// Returns true once [`destroy`](Self::destroy) has been called.
    #[must_use]
    pub fn is_killed(&self) -> bool { self.inner.killed.load(Ordering::SeqCst) }

    /// Number of completed reconnects.
    #[must_use]
    pub fn reconnect_count(&self) -> u64 { self.inner.reconnects.load(Ordering::SeqCst) }

    /// Connect, declare the queue, apply the prefetch limit and start the
    /// consumer delegate.
    ///
    /// Does nothing when already connected or destroyed.
    ///
    /// # Errors
    ///
    /// Returns the failing broker operation. Anything opened before the
    /// failure is closed first.
    pub async fn connect(&self) -> Result<()> {
        if self.is_killed() {
            return Ok(());
        }
        let mut state = self.inner.state.lock().await;
        self.connect_locked(&mut state).await
    }

    /// Stop the delegate and close the connection. The resource may connect
    /// again afterwards.
    ///
    /// # Errors
    ///
    /// Returns a [`ShutdownError`](crate::shutdown::ShutdownError) if any
    /// release step failed; every step is attempted regardless.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        self.close_locked(&mut state, ResourcePhase::Closed).await?;
        Ok(())
    }

    /// Close and connect again as one step.
    ///
    /// Does nothing once destroyed.
    ///
    /// # Errors
    ///
    /// Returns the connect failure. Close failures are logged only.
    pub async fn reconnect(&self) -> Result<()> {
        if self.is_killed() {
            return Ok(());
        }
        let mut state = self.inner.state.lock().await;
        self.reconnect_locked(&mut state).await
    }

    /// Latch the resource as killed and close it.
    ///
    /// Idempotent. Later [`connect`](Self::connect) and
    /// [`reconnect`](Self::reconnect) calls return immediately.
    ///
    /// # Errors
    ///
    /// Returns close failures from the first call.
    pub async fn destroy(&self) -> Result<()> {
        if self.inner.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let closed = {
            let mut state = self.inner.state.lock().await;
            self.close_locked(&mut state, ResourcePhase::Destroyed).await
        };
        self.inner.set_phase(ResourcePhase::Destroyed);
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!(consumer_tag = %self.inner.consumer_tag, "resource destroyed");
        closed?;
        Ok(())
    }

    /// Probe the connection, reconnecting once if the probe fails.
    ///
    /// Returns false when destroyed or when the resource cannot be repaired.
    pub async fn is_healthy(&self) -> bool {
        if self.is_killed() {
            return false;
        }
        let mut state = self.inner.state.lock().await;
        if let Some(session) = &state.session {
            if session.task.is_finished() || self.phase() == ResourcePhase::Cancelled {
                warn!(consumer_tag = %self.inner.consumer_tag, "consumer delegate has stopped; reconnecting");
            } else {
                match session.object.validate().await {
                    Ok(()) => return true,
                    Err(error) => {
                        warn!(consumer_tag = %self.inner.consumer_tag, %error, "health probe failed; reconnecting");
                    }
                }
            }
        } else {
            debug!(consumer_tag = %self.inner.consumer_tag, "health check found no live session; reconnecting");
        }
        if let Err(error) = self.reconnect_locked(&mut state).await {
            warn!(consumer_tag = %self.inner.consumer_tag, %error, "health repair failed");
            return false;
        }
        match &state.session {
            Some(session) => session.object.validate().await.is_ok(),
            None => false,
        }
    }

    async fn connect_locked(&self, state: &mut ResourceState) -> Result<()> {
        if self.is_killed() || state.session.is_some() {
            return Ok(());
        }
        let inner = &self.inner;
        let id = inner.next_object.fetch_add(1, Ordering::SeqCst) + 1;
        let object = ConnectionObject::open(inner.backend.as_ref(), &inner.config.uri, id).await?;
        if let Err(error) = self.prepare(&object).await {
            if let Err(cleanup) = object.destroy().await {
                debug!(%cleanup, "partial connect cleanup failed");
            }
            return Err(error.into());
        }

        state.generation += 1;
        let shutdown = CancellationToken::new();
        let context = ConsumerContext {
            queue: inner.config.queue.clone(),
            consumer_tag: inner.consumer_tag.clone(),
            channel: Arc::clone(object.channel()),
            callbacks: inner.callbacks.clone(),
            shutdown: shutdown.clone(),
        };
        let task = self.spawn_delegate(context, state.generation);
        state.session = Some(Session {
            object,
            shutdown,
            task,
        });
        inner.set_phase(ResourcePhase::Connected);
        metrics::inc_resources();
        info!(
            queue = %inner.config.queue,
            consumer_tag = %inner.consumer_tag,
            consumer = %inner.config.consumer.kind,
            "resource connected"
        );
        Ok(())
    }

    async fn prepare(&self, object: &ConnectionObject) -> std::result::Result<(), TransportError> {
        let config = &self.inner.config;
        let channel = object.channel();
        channel.declare_queue(&config.queue, &config.declare).await?;
        if let Some(limit) = config.prefetch {
            channel.set_prefetch(limit).await?;
        }
        Ok(())
    }

    fn spawn_delegate(&self, context: ConsumerContext, generation: u64) -> JoinHandle<()> {
        let kind = self.inner.config.consumer.kind;
        let merging = self.inner.config.merging.clone();
        let weak = Arc::downgrade(&self.inner);
        let tag = self.inner.consumer_tag.clone();
        self.inner.tracker.spawn(async move {
            let run = AssertUnwindSafe(consumer::run(kind, context, merging)).catch_unwind();
            let exit = match run.await {
                Ok(exit) => exit,
                Err(panic) => {
                    let panic_msg = format_panic(panic);
                    log::error!("consumer task panicked: panic={panic_msg}, consumer_tag={tag}");
                    tracing::error!(panic = %panic_msg, consumer_tag = %tag, "consumer task panicked");
                    ConsumerExit::Failed(TransportError::ChannelClosed)
                }
            };
            match exit {
                ConsumerExit::Shutdown => debug!(consumer_tag = %tag, "consumer stopped"),
                ConsumerExit::Cancelled => {
                    warn!(consumer_tag = %tag, "subscription cancelled by broker");
                    recover(&weak, generation, ResourcePhase::Cancelled);
                }
                ConsumerExit::Failed(error) => {
                    metrics::inc_errors(metrics::ErrorKind::Transport);
                    warn!(consumer_tag = %tag, %error, "consumer failed");
                    recover(&weak, generation, ResourcePhase::Closed);
                }
            }
        })
    }

    async fn close_locked(
        &self,
        state: &mut ResourceState,
        phase: ResourcePhase,
    ) -> std::result::Result<(), ShutdownError> {
        let Some(session) = state.session.take() else {
            if self.inner.phase() != ResourcePhase::Destroyed {
                self.inner.set_phase(phase);
            }
            return Ok(());
        };
        state.generation += 1;
        session.shutdown.cancel();
        let mut shutdown = BestEffort::new("connection resource");
        if let Err(error) = session.task.await {
            shutdown.record("stop consumer", Err(TransportError::io("join", error.to_string())));
        }
        if let Err(error) = session.object.destroy().await {
            shutdown.absorb(error);
        }
        metrics::dec_resources();
        self.inner.set_phase(phase);
        debug!(consumer_tag = %self.inner.consumer_tag, "resource closed");
        shutdown.finish()
    }

    async fn reconnect_locked(&self, state: &mut ResourceState) -> Result<()> {
        if self.is_killed() {
            return Ok(());
        }
        self.inner.set_phase(ResourcePhase::Reconnecting);
        if let Err(error) = self.close_locked(state, ResourcePhase::Reconnecting).await {
            debug!(%error, "close before reconnect reported failures");
        }
        let connected = self.connect_locked(state).await;
        if connected.is_ok() {
            self.inner.reconnects.fetch_add(1, Ordering::SeqCst);
            metrics::inc_reconnects();
            info!(consumer_tag = %self.inner.consumer_tag, "resource reconnected");
        } else {
            self.inner.set_phase(ResourcePhase::Closed);
        }
        connected
    }
}

/// React to a delegate that stopped on its own.
///
/// Recovery runs on a separate task so the delegate's own task can finish
/// before `close` waits for it.
fn recover(weak: &Weak<ResourceInner>, generation: u64, idle_phase: ResourcePhase) {
    let Some(inner) = weak.upgrade() else { return };
    if inner.killed.load(Ordering::SeqCst) {
        return;
    }
    if !inner.config.consumer.cancel_recovery {
        inner.set_phase(idle_phase);
        return;
    }
    let resource = ConnectionResource {
        inner: Arc::clone(&inner),
    };
    inner.tracker.spawn(async move {
        let mut state = resource.inner.state.lock().await;
        if state.generation != generation {
            return;
        }
        if let Err(error) = resource.reconnect_locked(&mut state).await {
            warn!(consumer_tag = %resource.inner.consumer_tag, %error, "automatic reconnect failed");
        }
    });
}

#[cfg(test)]
mod tests;
