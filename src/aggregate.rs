//! Format-homogeneous accumulator for merged dispatch.
//!
//! `MessageAggregate` collects inbound [`Message`]s until a flush is due. The
//! first accepted message fixes the batch's encoding discriminant; later
//! messages announcing a different encoding are quarantined rather than
//! merged. Accepted messages are indexed both in arrival order and by their
//! declared reply destination.
//!
//! The aggregate carries no internal locking. It is owned by exactly one
//! consumer task, which is the only code path that ever mutates it.

use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

use crate::{
    error::BridgeError,
    format::Format,
    message::{Message, ReplyDestination},
};

/// Outcome of offering a message to [`MessageAggregate::add`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The message joined the batch.
    Accepted,
    /// The message disagreed with the batch encoding and was set aside.
    Quarantined,
}

/// Messages sharing one reply destination, in arrival order.
#[derive(Debug)]
pub struct ReplyGroup<'a> {
    /// Shared reply destination; `None` groups messages that declared none.
    pub reply_to: Option<&'a ReplyDestination>,
    /// Members of the group.
    pub messages: Vec<&'a Message>,
}

/// Accumulator of format-homogeneous messages awaiting a merged flush.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use queuebridge::{
///     aggregate::{Admission, MessageAggregate},
///     message::{Envelope, Message},
/// };
/// use tokio::time::Instant;
///
/// let now = Instant::now();
/// let mut aggregate = MessageAggregate::new();
/// let json = Message::new(Bytes::from_static(b"{}"), Envelope::default(), now);
/// let xml = Message::new(Bytes::from_static(b"<a/>"), Envelope::default(), now);
///
/// assert_eq!(aggregate.add(json).expect("non-empty body"), Admission::Accepted);
/// assert_eq!(aggregate.add(xml).expect("non-empty body"), Admission::Quarantined);
/// assert_eq!(aggregate.len(), 1);
/// assert_eq!(aggregate.quarantined().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MessageAggregate {
    ordered: Vec<Message>,
    by_reply: HashMap<Option<ReplyDestination>, Vec<usize>>,
    reply_order: Vec<Option<ReplyDestination>>,
    quarantined: Vec<Message>,
    discriminant: Option<u8>,
}

impl MessageAggregate {
    /// Create an empty aggregate with no established encoding.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Offer a message to the batch.
    ///
    /// The first accepted message establishes the encoding discriminant.
    /// Messages whose leading byte differs are quarantined and never merged
    /// into the current batch.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::EmptyBody`] if the message carries no payload.
    pub fn add(&mut self, message: Message) -> Result<Admission, BridgeError> {
        let Some(leading) = message.discriminant() else {
            return Err(BridgeError::EmptyBody);
        };
        let established = *self.discriminant.get_or_insert(leading);
        if leading != established {
            self.quarantined.push(message);
            return Ok(Admission::Quarantined);
        }

        let key = message.reply_destination().cloned();
        let index = self.ordered.len();
        self.ordered.push(message);
        match self.by_reply.get_mut(&key) {
            Some(bucket) => bucket.push(index),
            None => {
                self.reply_order.push(key.clone());
                self.by_reply.insert(key, vec![index]);
            }
        }
        Ok(Admission::Accepted)
    }

    /// Decide whether the accumulated batch should be flushed.
    ///
    /// A flush is due once `min_count` messages are held, or once the oldest
    /// held message has waited at least `max_wait`. Gating on the head of
    /// the batch bounds the latency of the first message in a slow trickle.
    #[must_use]
    pub fn is_flush_due(&self, min_count: usize, max_wait: Duration, now: Instant) -> bool {
        if self.ordered.len() >= min_count {
            return true;
        }
        self.ordered
            .first()
            .is_some_and(|head| now.saturating_duration_since(head.arrived_at()) >= max_wait)
    }

    /// Clear every collection and forget the established encoding.
    pub fn reset(&mut self) {
        self.ordered.clear();
        self.by_reply.clear();
        self.reply_order.clear();
        self.quarantined.clear();
        self.discriminant = None;
    }

    /// Remove and return the quarantined messages, leaving the batch intact.
    pub fn take_quarantined(&mut self) -> Vec<Message> { std::mem::take(&mut self.quarantined) }

    /// Remove every held message (accepted first, then quarantined) and reset.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut drained = std::mem::take(&mut self.ordered);
        drained.append(&mut self.quarantined);
        self.reset();
        drained
    }

    /// Accepted messages in arrival order.
    #[must_use]
    pub fn ordered(&self) -> &[Message] { &self.ordered }

    /// Messages set aside because of an encoding mismatch.
    #[must_use]
    pub fn quarantined(&self) -> &[Message] { &self.quarantined }

    /// Number of accepted messages.
    #[must_use]
    pub fn len(&self) -> usize { self.ordered.len() }

    /// Returns true when no message has been accepted.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.ordered.is_empty() }

    /// Established discriminant byte, if any message was accepted since the
    /// last reset.
    #[must_use]
    pub fn discriminant(&self) -> Option<u8> { self.discriminant }

    /// Established encoding family.
    #[must_use]
    pub fn format(&self) -> Option<Format> { self.discriminant.map(Format::from_discriminant) }

    /// Accepted messages grouped by reply destination.
    ///
    /// Groups appear in the order their destination was first seen; members
    /// keep arrival order. Messages without a reply destination form the
    /// `None` group.
    #[must_use]
    pub fn reply_groups(&self) -> Vec<ReplyGroup<'_>> {
        self.reply_order
            .iter()
            .map(|key| ReplyGroup {
                reply_to: key.as_ref(),
                messages: self
                    .by_reply
                    .get(key)
                    .map(|indices| indices.iter().map(|&i| &self.ordered[i]).collect())
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// The whole batch as one group.
    ///
    /// The group's reply destination is the first one declared in the batch.
    #[must_use]
    pub fn single_group(&self) -> ReplyGroup<'_> {
        ReplyGroup {
            reply_to: self.ordered.iter().find_map(Message::reply_destination),
            messages: self.ordered.iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests;
