//! Registry of transport backends keyed by configuration name.
//!
//! Backends are resolved once when an endpoint starts; nothing looks a
//! backend up per call.

use std::{collections::HashMap, fmt, sync::Arc};

use super::{TransportBackend, memory::MemoryBackend};
use crate::{config::BridgeConfig, error::ConfigError};

/// Maps configuration strings such as `memory` or `amqp` to backends.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn TransportBackend>>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.backends.keys().collect();
        names.sort();
        f.debug_struct("BackendRegistry")
            .field("backends", &names)
            .finish()
    }
}

impl BackendRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Registry holding a fresh in-memory broker under `memory` and, when
    /// the `amqp` feature is enabled, the AMQP backend under `amqp` and
    /// `amqps`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new().with("memory", Arc::new(MemoryBackend::default()));
        #[cfg(feature = "amqp")]
        let registry = {
            let amqp: Arc<dyn TransportBackend> = Arc::new(super::amqp::AmqpBackend::default());
            registry.with("amqp", Arc::clone(&amqp)).with("amqps", amqp)
        };
        registry
    }

    /// Register `backend` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn TransportBackend>) {
        self.backends.insert(name.into(), backend);
    }

    /// Builder-style variant of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, backend: Arc<dyn TransportBackend>) -> Self {
        self.register(name, backend);
        self
    }

    /// Look up a backend by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownBackend`] if nothing is registered under
    /// `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn TransportBackend>, ConfigError> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownBackend { name: name.into() })
    }

    /// Resolve the backend selected by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownBackend`] if the configured backend is
    /// not registered.
    pub fn resolve(&self, config: &BridgeConfig) -> Result<Arc<dyn TransportBackend>, ConfigError> {
        self.get(config.backend_name())
    }
}
