//! Canonical error and result types for the crate.
//!
//! Transport failures, configuration problems and callback-engine failures
//! each get their own enum; [`BridgeError`] is the single surface returned by
//! the public API.

use std::{error::Error as StdError, time::Duration};

use thiserror::Error;

use crate::shutdown::ShutdownError;

/// Error type returned by the callback engine behind [`crate::service::CallbackService`].
pub type ServiceError = Box<dyn StdError + Send + Sync>;

/// Failures raised by a broker backend.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broker could not be reached or refused the connection.
    #[error("failed to connect to broker at {uri}: {source}")]
    Connect {
        /// Connection string used for the attempt.
        uri: String,
        /// Backend-specific cause.
        #[source]
        source: ServiceError,
    },
    /// The channel or connection was closed underneath the caller.
    #[error("broker channel is closed")]
    ChannelClosed,
    /// The named queue does not exist on the broker.
    #[error("queue {queue} does not exist")]
    QueueNotFound {
        /// Name of the missing queue.
        queue: String,
    },
    /// A broker operation failed.
    #[error("broker operation {operation} failed: {source}")]
    Io {
        /// Operation being performed, for example `publish`.
        operation: &'static str,
        /// Backend-specific cause.
        #[source]
        source: ServiceError,
    },
    /// A fault injected by the in-memory backend.
    #[error("injected fault during {operation}")]
    Injected {
        /// Operation the fault was injected into.
        operation: &'static str,
    },
}

impl TransportError {
    /// Wrap a backend error raised by `operation`.
    pub fn io(operation: &'static str, source: impl Into<ServiceError>) -> Self {
        Self::Io {
            operation,
            source: source.into(),
        }
    }

    /// Returns true if the error reports a missing queue.
    ///
    /// Consumers treat this as a broker-initiated cancellation of their
    /// subscription.
    #[must_use]
    pub fn is_queue_missing(&self) -> bool { matches!(self, Self::QueueNotFound { .. }) }
}

/// Errors raised while parsing a [`crate::config::BridgeConfig`].
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required key was absent from the initialization map.
    #[error("missing required configuration key {key}")]
    Missing {
        /// Key that was expected.
        key: &'static str,
    },
    /// A key carried a value that could not be parsed.
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        /// Offending key.
        key: String,
        /// Raw value as supplied.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// No backend is registered under the requested name.
    #[error("no transport backend registered as {name}")]
    UnknownBackend {
        /// Requested backend name.
        name: String,
    },
}

/// Top-level error type exposed by `queuebridge`.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Broker I/O failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// No pooled connection became available in time.
    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolExhausted {
        /// Configured wait before giving up, if any.
        waited: Option<Duration>,
    },
    /// The connection pool has been closed.
    #[error("connection pool is closed")]
    PoolClosed,
    /// The callback engine failed to process a request.
    #[error("callback engine failed: {0}")]
    Processing(#[source] ServiceError),
    /// A message with an empty body was offered to an aggregate.
    #[error("message body is empty")]
    EmptyBody,
    /// One or more release steps failed during shutdown.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
    /// No reply arrived on the reply destination before the read timeout.
    #[error("no reply received within {0:?}")]
    ReplyTimeout(Duration),
}

impl BridgeError {
    /// Returns true if the failure originated from the broker transport.
    #[must_use]
    pub fn is_transport(&self) -> bool { matches!(self, Self::Transport(_)) }
}

/// Canonical result alias used by `queuebridge` public APIs.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_missing_is_detected() {
        let err = TransportError::QueueNotFound {
            queue: "orders".into(),
        };
        assert!(err.is_queue_missing());
        assert!(!TransportError::ChannelClosed.is_queue_missing());
    }

    #[test]
    fn transport_errors_convert_into_bridge_errors() {
        let err: BridgeError = TransportError::ChannelClosed.into();
        assert!(err.is_transport());
        assert_eq!(err.to_string(), "broker channel is closed");
    }

    #[test]
    fn config_error_names_the_key() {
        let err = ConfigError::Invalid {
            key: "pool.max_size".into(),
            value: "zero".into(),
            reason: "expected an integer".into(),
        };
        assert!(err.to_string().contains("pool.max_size"));
    }
}
