//! Outbound side of the bridge: sending requests and fetching replies.
//!
//! Both [`Producer`] and [`Extractor`] borrow a
//! [`ConnectionObject`](crate::pool::ConnectionObject) per call from a shared
//! [`ConnectionPool`](crate::pool::ConnectionPool). An object that hit a
//! broker failure is invalidated rather than returned.

mod extractor;
mod producer;

pub use extractor::{Extractor, ReceiveAttributes};
pub use producer::{Producer, ReplyTo, SendAttributes, SendOutcome};

use crate::{error::BridgeError, pool::Lease};

/// Release `lease` after a successful call, or invalidate it when the call
/// failed at the transport level.
async fn settle<T>(lease: Lease, outcome: Result<T, BridgeError>) -> Result<T, BridgeError> {
    match &outcome {
        Err(error) if error.is_transport() => lease.invalidate().await,
        _ => lease.release().await,
    }
    outcome
}
