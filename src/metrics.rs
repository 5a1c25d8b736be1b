//! Metric helpers for `queuebridge`.
//!
//! This module defines metric names and simple helper functions wrapping
//! the [`metrics`](https://docs.rs/metrics) crate. Without the `metrics`
//! feature the helpers compile to no-ops.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the counter tracking messages taken off the queue.
pub const MESSAGES_CONSUMED: &str = "queuebridge_messages_consumed_total";
/// Name of the counter tracking merged batches handed to the engine.
pub const BATCHES_FLUSHED: &str = "queuebridge_batches_flushed_total";
/// Name of the counter tracking off-format messages returned to the queue.
pub const MESSAGES_QUARANTINED: &str = "queuebridge_messages_quarantined_total";
/// Name of the counter tracking replies published.
pub const REPLIES_PUBLISHED: &str = "queuebridge_replies_published_total";
/// Name of the counter tracking error occurrences.
pub const ERRORS_TOTAL: &str = "queuebridge_errors_total";
/// Name of the counter tracking resource reconnects.
pub const RECONNECTS: &str = "queuebridge_reconnects_total";
/// Name of the gauge tracking connected resources.
pub const RESOURCES_ACTIVE: &str = "queuebridge_resources_active";

/// Consumption discipline of a consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// One message per engine call.
    Single,
    /// Batched engine calls.
    Merged,
}

impl Mode {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Mode::Single => "single",
            Mode::Merged => "merged",
        }
    }
}

/// Category of a recorded error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Broker I/O failed.
    Transport,
    /// The callback engine failed or panicked.
    Processing,
    /// A reply could not be published.
    Reply,
    /// A delivery could not be acknowledged or rejected.
    Ack,
}

impl ErrorKind {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Processing => "processing",
            ErrorKind::Reply => "reply",
            ErrorKind::Ack => "ack",
        }
    }
}

/// Record `count` consumed messages.
pub fn add_consumed(mode: Mode, count: u64) {
    #[cfg(feature = "metrics")]
    counter!(MESSAGES_CONSUMED, "mode" => mode.as_str()).increment(count);
    #[cfg(not(feature = "metrics"))]
    let _ = (mode, count);
}

/// Record a flushed batch.
pub fn inc_batches() {
    #[cfg(feature = "metrics")]
    counter!(BATCHES_FLUSHED).increment(1);
}

/// Record `count` quarantined messages.
pub fn add_quarantined(count: u64) {
    #[cfg(feature = "metrics")]
    counter!(MESSAGES_QUARANTINED).increment(count);
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

/// Record a published reply.
pub fn inc_replies() {
    #[cfg(feature = "metrics")]
    counter!(REPLIES_PUBLISHED).increment(1);
}

/// Record an error occurrence.
pub fn inc_errors(kind: ErrorKind) {
    #[cfg(feature = "metrics")]
    counter!(ERRORS_TOTAL, "kind" => kind.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = kind;
}

/// Record a resource reconnect.
pub fn inc_reconnects() {
    #[cfg(feature = "metrics")]
    counter!(RECONNECTS).increment(1);
}

/// Increment the connected resources gauge.
pub fn inc_resources() {
    #[cfg(feature = "metrics")]
    gauge!(RESOURCES_ACTIVE).increment(1.0);
}

/// Decrement the connected resources gauge.
pub fn dec_resources() {
    #[cfg(feature = "metrics")]
    gauge!(RESOURCES_ACTIVE).decrement(1.0);
}
