//! Tests for [`MessageAggregate`].

use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use rstest::{fixture, rstest};
use tokio::time::Instant;

use super::{Admission, MessageAggregate};
use crate::{
    error::BridgeError,
    format::Format,
    message::{DeliveryTag, Envelope, Message, ReplyDestination},
};

fn message(body: &'static [u8], tag: u64, reply_to: Option<&str>, arrived_at: Instant) -> Message {
    Message::new(
        Bytes::from_static(body),
        Envelope {
            delivery_tag: DeliveryTag::new(tag),
            reply_to: reply_to.map(ReplyDestination::from),
            ..Envelope::default()
        },
        arrived_at,
    )
}

#[fixture]
fn aggregate() -> MessageAggregate { MessageAggregate::new() }

#[rstest]
fn first_message_establishes_encoding(mut aggregate: MessageAggregate) {
    assert_eq!(aggregate.discriminant(), None);
    let admission = aggregate
        .add(message(b"<a/>", 1, None, Instant::now()))
        .expect("add xml");
    assert_eq!(admission, Admission::Accepted);
    assert_eq!(aggregate.discriminant(), Some(b'<'));
    assert_eq!(aggregate.format(), Some(Format::Xml));
}

#[rstest]
fn empty_body_is_rejected(mut aggregate: MessageAggregate) {
    let err = aggregate
        .add(message(b"", 1, None, Instant::now()))
        .expect_err("empty body must fail");
    assert!(matches!(err, BridgeError::EmptyBody));
    assert!(aggregate.is_empty());
    assert_eq!(aggregate.discriminant(), None);
}

/// Two JSON messages and one XML message: the XML message is quarantined
/// and the batch holds only JSON.
#[rstest]
fn mixed_encodings_are_quarantined(mut aggregate: MessageAggregate) {
    let now = Instant::now();
    aggregate.add(message(b"{\"a\":1}", 1, None, now)).expect("json");
    let xml = aggregate.add(message(b"<b/>", 2, None, now)).expect("xml");
    aggregate.add(message(b"{\"c\":3}", 3, None, now)).expect("json");

    assert_eq!(xml, Admission::Quarantined);
    let tags: Vec<_> = aggregate.ordered().iter().map(Message::delivery_tag).collect();
    assert_eq!(tags, vec![DeliveryTag::new(1), DeliveryTag::new(3)]);
    assert_eq!(aggregate.quarantined().len(), 1);
    assert_eq!(aggregate.quarantined()[0].delivery_tag(), DeliveryTag::new(2));
    assert!(aggregate.is_flush_due(2, Duration::from_secs(10), now));
}

#[rstest]
#[case(3, 10_000, 0, true)]
#[case(5, 10_000, 50, false)]
#[case(5, 10_000, 10_000, true)]
#[case(5, 10_000, 9_999, false)]
#[case(4, 0, 0, true)]
fn flush_due_honours_count_and_age(
    mut aggregate: MessageAggregate,
    #[case] min_count: usize,
    #[case] max_wait_ms: u64,
    #[case] elapsed_ms: u64,
    #[case] expected: bool,
) {
    let start = Instant::now();
    for tag in 1..=3 {
        aggregate
            .add(message(b"{}", tag, None, start))
            .expect("add json");
    }
    let now = start + Duration::from_millis(elapsed_ms);
    assert_eq!(
        aggregate.is_flush_due(min_count, Duration::from_millis(max_wait_ms), now),
        expected
    );
}

#[rstest]
fn oldest_message_gates_the_wait(mut aggregate: MessageAggregate) {
    let start = Instant::now();
    aggregate.add(message(b"{}", 1, None, start)).expect("head");
    aggregate
        .add(message(b"{}", 2, None, start + Duration::from_millis(900)))
        .expect("tail");

    let now = start + Duration::from_millis(1_000);
    assert!(aggregate.is_flush_due(10, Duration::from_millis(1_000), now));
}

#[rstest]
fn empty_aggregate_is_never_due_by_age(aggregate: MessageAggregate) {
    let now = Instant::now() + Duration::from_secs(3_600);
    assert!(!aggregate.is_flush_due(1, Duration::ZERO, now));
}

#[rstest]
fn reset_clears_everything(mut aggregate: MessageAggregate) {
    let now = Instant::now();
    aggregate.add(message(b"{}", 1, Some("r1"), now)).expect("json");
    aggregate.add(message(b"<x/>", 2, None, now)).expect("xml");
    aggregate.reset();

    assert!(aggregate.is_empty());
    assert!(aggregate.quarantined().is_empty());
    assert!(aggregate.reply_groups().is_empty());
    assert_eq!(aggregate.discriminant(), None);

    let admission = aggregate.add(message(b"<y/>", 3, None, now)).expect("xml");
    assert_eq!(admission, Admission::Accepted);
}

#[rstest]
fn reply_groups_partition_the_batch(mut aggregate: MessageAggregate) {
    let now = Instant::now();
    aggregate.add(message(b"{}", 1, Some("a"), now)).expect("1");
    aggregate.add(message(b"{}", 2, None, now)).expect("2");
    aggregate.add(message(b"{}", 3, Some("b"), now)).expect("3");
    aggregate.add(message(b"{}", 4, Some("a"), now)).expect("4");

    let groups = aggregate.reply_groups();
    let summary: Vec<_> = groups
        .iter()
        .map(|group| {
            (
                group.reply_to.map(ReplyDestination::as_str),
                group
                    .messages
                    .iter()
                    .map(|m| m.delivery_tag().get())
                    .collect::<Vec<_>>(),
            )
        })
        .collect();
    assert_eq!(
        summary,
        vec![
            (Some("a"), vec![1, 4]),
            (None, vec![2]),
            (Some("b"), vec![3]),
        ]
    );
}

#[rstest]
fn single_group_uses_first_declared_destination(mut aggregate: MessageAggregate) {
    let now = Instant::now();
    aggregate.add(message(b"{}", 1, None, now)).expect("1");
    aggregate.add(message(b"{}", 2, Some("late"), now)).expect("2");

    let group = aggregate.single_group();
    assert_eq!(group.reply_to.map(ReplyDestination::as_str), Some("late"));
    assert_eq!(group.messages.len(), 2);
}

#[rstest]
fn take_quarantined_leaves_batch(mut aggregate: MessageAggregate) {
    let now = Instant::now();
    aggregate.add(message(b"{}", 1, None, now)).expect("json");
    aggregate.add(message(b"<x/>", 2, None, now)).expect("xml");

    let released = aggregate.take_quarantined();
    assert_eq!(released.len(), 1);
    assert!(aggregate.quarantined().is_empty());
    assert_eq!(aggregate.len(), 1);
    assert_eq!(aggregate.discriminant(), Some(b'{'));
}

#[rstest]
fn drain_returns_accepted_then_quarantined(mut aggregate: MessageAggregate) {
    let now = Instant::now();
    aggregate.add(message(b"{}", 1, None, now)).expect("json");
    aggregate.add(message(b"<x/>", 2, None, now)).expect("xml");
    aggregate.add(message(b"{}", 3, None, now)).expect("json");

    let tags: Vec<_> = aggregate
        .drain()
        .iter()
        .map(|m| m.delivery_tag().get())
        .collect();
    assert_eq!(tags, vec![1, 3, 2]);
    assert!(aggregate.is_empty());
    assert_eq!(aggregate.discriminant(), None);
}

fn arb_body() -> impl Strategy<Value = Vec<u8>> {
    (
        prop::sample::select(vec![b'{', b'<', b'[', 0x01]),
        prop::collection::vec(any::<u8>(), 0..4),
    )
        .prop_map(|(lead, rest)| {
            let mut body = vec![lead];
            body.extend(rest);
            body
        })
}

proptest! {
    #[test]
    fn accepted_messages_share_the_discriminant(
        bodies in prop::collection::vec(arb_body(), 1..40),
        replies in prop::collection::vec(prop::option::of(0u8..3), 40),
    ) {
        let now = Instant::now();
        let mut aggregate = MessageAggregate::new();
        for (i, body) in bodies.iter().enumerate() {
            let envelope = Envelope {
                delivery_tag: DeliveryTag::new(i as u64),
                reply_to: replies[i].map(|r| ReplyDestination::from(format!("reply-{r}"))),
                ..Envelope::default()
            };
            aggregate
                .add(Message::new(Bytes::from(body.clone()), envelope, now))
                .expect("non-empty body");
        }

        let established = bodies[0][0];
        prop_assert_eq!(aggregate.discriminant(), Some(established));
        for accepted in aggregate.ordered() {
            prop_assert_eq!(accepted.discriminant(), Some(established));
        }
        for set_aside in aggregate.quarantined() {
            prop_assert_ne!(set_aside.discriminant(), Some(established));
        }
        let expected_quarantined = bodies.iter().filter(|b| b[0] != established).count();
        prop_assert_eq!(aggregate.quarantined().len(), expected_quarantined);
        prop_assert_eq!(aggregate.len() + expected_quarantined, bodies.len());

        let grouped: usize = aggregate.reply_groups().iter().map(|g| g.messages.len()).sum();
        prop_assert_eq!(grouped, aggregate.len());
        for group in aggregate.reply_groups() {
            for member in &group.messages {
                prop_assert_eq!(member.reply_destination(), group.reply_to);
            }
        }
    }
}
