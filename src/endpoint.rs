//! One configured bridge endpoint.
//!
//! An [`Endpoint`] runs `consumer.instances` parallel
//! [`ConnectionResource`]s on the configured queue and hands out
//! [`Producer`]s and [`Extractor`]s that share a single [`ConnectionPool`].

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures::future::join_all;
use static_assertions::assert_impl_all;
use tracing::info;

use crate::{
    config::BridgeConfig,
    error::{BridgeError, Result, TransportError},
    outbound::{Extractor, Producer},
    pool::ConnectionPool,
    resource::ConnectionResource,
    service::{CallbackService, Callbacks, ResponseObserver},
    shutdown::BestEffort,
    transport::BackendRegistry,
};

/// Running consumers plus outbound factories for one queue.
#[derive(Debug)]
pub struct Endpoint {
    config: Arc<BridgeConfig>,
    resources: Vec<ConnectionResource>,
    pool: ConnectionPool,
    callbacks: Callbacks,
    destroyed: AtomicBool,
}

assert_impl_all!(Endpoint: Send, Sync);

impl Endpoint {
    /// Resolve the backend, connect every consumer instance and return the
    /// running endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownBackend`](crate::error::ConfigError)
    /// when the backend is not registered, or the first connect failure.
    /// Instances already connected are destroyed before returning.
    pub async fn start(
        config: BridgeConfig,
        registry: &BackendRegistry,
        service: Arc<dyn CallbackService>,
        observer: Option<Arc<dyn ResponseObserver>>,
    ) -> Result<Self> {
        let backend = registry.resolve(&config)?;
        let config = Arc::new(config);
        let mut callbacks = Callbacks::new(service);
        if let Some(observer) = observer {
            callbacks = callbacks.with_observer(observer);
        }

        let pool = ConnectionPool::new(Arc::clone(&backend), config.uri.clone(), &config.pool);
        let resources: Vec<_> = (0..config.consumer.instances)
            .map(|index| {
                ConnectionResource::new(
                    Arc::clone(&backend),
                    Arc::clone(&config),
                    index,
                    callbacks.clone(),
                )
            })
            .collect();

        for (index, resource) in resources.iter().enumerate() {
            if let Err(error) = resource.connect().await {
                for started in &resources[..index] {
                    if let Err(cleanup) = started.destroy().await {
                        tracing::debug!(%cleanup, "teardown after failed start reported failures");
                    }
                }
                return Err(error);
            }
        }

        info!(
            queue = %config.queue,
            backend = backend.name(),
            instances = resources.len(),
            pooled = pool.is_pooled(),
            "endpoint started"
        );
        Ok(Self {
            config,
            resources,
            pool,
            callbacks,
            destroyed: AtomicBool::new(false),
        })
    }

    /// Configuration the endpoint was started with.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig { &self.config }

    /// The consumer instances.
    #[must_use]
    pub fn resources(&self) -> &[ConnectionResource] { &self.resources }

    /// Pool shared by every producer and extractor of this endpoint.
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool { &self.pool }

    /// Producer publishing to the endpoint's queue.
    #[must_use]
    pub fn producer(&self) -> Producer {
        Producer::new(
            self.pool.clone(),
            self.config.queue.clone(),
            self.config.producer.clone(),
        )
    }

    /// Extractor reading the endpoint's queue by default.
    #[must_use]
    pub fn extractor(&self) -> Extractor { Extractor::new(self.pool.clone(), self.config.queue.clone()) }

    /// Check every resource, repairing where possible, and the callback
    /// engine.
    pub async fn is_healthy(&self) -> bool {
        if self.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        let checks = join_all(self.resources.iter().map(ConnectionResource::is_healthy)).await;
        checks.into_iter().all(|healthy| healthy) && self.callbacks.service.is_healthy()
    }

    /// Destroy every resource, close the pool and release the callback
    /// engine.
    ///
    /// Every step is attempted even if an earlier one failed. Calling this
    /// again does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Shutdown`] listing the failed release steps.
    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut shutdown = BestEffort::new("endpoint");
        for resource in &self.resources {
            absorb(&mut shutdown, "destroy resource", resource.destroy().await);
        }
        absorb(&mut shutdown, "close pool", self.pool.close().await);
        self.callbacks.service.destroy().await;
        info!(queue = %self.config.queue, "endpoint destroyed");
        shutdown.finish()?;
        Ok(())
    }
}

fn absorb(shutdown: &mut BestEffort, step: &'static str, outcome: Result<()>) {
    match outcome {
        Ok(()) => {}
        Err(BridgeError::Shutdown(nested)) => shutdown.absorb(nested),
        Err(other) => shutdown.record(step, Err(TransportError::io(step, other.to_string()))),
    }
}
