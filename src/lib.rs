#![doc(html_root_url = "https://docs.rs/queuebridge/latest")]
//! Public API for the `queuebridge` library.
//!
//! This crate bridges a request/response service engine onto a message
//! broker: it pools broker connections, runs per-message and batching
//! consumers, manages subscription lifecycles, and publishes requests and
//! replies.

pub mod aggregate;
pub mod config;
pub mod consumer;
pub mod endpoint;
pub mod error;
pub mod format;
pub mod message;
pub mod metrics;
pub mod outbound;
pub mod panic;
pub mod pool;
pub mod resource;
pub mod service;
pub mod shutdown;
pub mod transport;

pub use aggregate::MessageAggregate;
pub use config::BridgeConfig;
pub use consumer::ConsumerKind;
pub use endpoint::Endpoint;
/// Result type alias used throughout the public API.
pub use error::{BridgeError, Result};
pub use format::Format;
pub use message::{DeliveryTag, Message, ReplyDestination};
pub use outbound::{Extractor, Producer, ReceiveAttributes, ReplyTo, SendAttributes};
pub use pool::ConnectionPool;
pub use resource::{ConnectionResource, ResourcePhase};
pub use service::{CallbackService, ResponseObserver};
pub use transport::{BackendRegistry, DeliveryMode};
