#![cfg(feature = "metrics")]
//! Tests for `queuebridge` metrics helpers.
//!
//! These tests verify that counters and gauges update as expected using
//! `metrics_util::debugging::DebuggingRecorder`.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use metrics::{SharedString, Unit};
use metrics_util::{
    CompositeKey,
    debugging::{DebugValue, DebuggingRecorder, Snapshotter},
};
use queuebridge::{
    BackendRegistry,
    BridgeConfig,
    CallbackService,
    Endpoint,
    error::ServiceError,
    format::Format,
    metrics::{self as qm, ErrorKind, Mode},
    transport::{QueueSpec, memory::MemoryBroker},
};
use rstest::rstest;
use serial_test::serial;

/// Creates a debugging recorder and snapshotter for metrics testing.
fn debugging_recorder_setup() -> (Snapshotter, DebuggingRecorder) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    (snapshotter, recorder)
}

type Snapshot = [(CompositeKey, Option<Unit>, Option<SharedString>, DebugValue)];

/// Sum of the counters named `name`, optionally restricted to one label.
///
/// Snapshots drain counters, so take one per test and read it here.
fn counter(snapshot: &Snapshot, name: &str, label: Option<(&str, &str)>) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _, _, _)| {
            key.key().name() == name
                && label.is_none_or(|(k, v)| {
                    key.key().labels().any(|l| l.key() == k && l.value() == v)
                })
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(count) => *count,
            _ => 0,
        })
        .sum()
}

#[rstest]
#[case(Mode::Single, "single")]
#[case(Mode::Merged, "merged")]
fn consumed_metric_is_labelled_by_mode(#[case] mode: Mode, #[case] label: &str) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || qm::add_consumed(mode, 3));

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(
        counter(&snapshot, qm::MESSAGES_CONSUMED, Some(("mode", label))),
        3
    );
}

#[rstest]
#[case(ErrorKind::Transport, "transport")]
#[case(ErrorKind::Processing, "processing")]
#[case(ErrorKind::Reply, "reply")]
#[case(ErrorKind::Ack, "ack")]
fn error_metric_is_labelled_by_kind(#[case] kind: ErrorKind, #[case] label: &str) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || qm::inc_errors(kind));

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(counter(&snapshot, qm::ERRORS_TOTAL, Some(("kind", label))), 1);
}

#[test]
fn resources_gauge_tracks_connects_and_closes() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        qm::inc_resources();
        qm::inc_resources();
        qm::dec_resources();
    });

    let gauge = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .find(|(key, _, _, _)| key.key().name() == qm::RESOURCES_ACTIVE)
        .map(|(_, _, _, value)| value);
    assert!(matches!(gauge, Some(DebugValue::Gauge(g)) if g.into_inner() == 1.0));
}

struct Echo;

#[async_trait]
impl CallbackService for Echo {
    async fn process_one(&self, request: Bytes) -> Result<Bytes, ServiceError> { Ok(request) }

    async fn process_merged(
        &self,
        requests: Vec<Bytes>,
        _format: Format,
    ) -> Result<Bytes, ServiceError> {
        Ok(Bytes::from(requests.concat()))
    }
}

#[tokio::test]
#[serial]
async fn served_requests_are_counted() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    let _guard = metrics::set_default_local_recorder(&recorder);
    let broker = MemoryBroker::new();
    broker.declare("replies", QueueSpec::default());
    let registry = BackendRegistry::new().with("memory", Arc::new(broker.backend()));
    let endpoint = Endpoint::start(
        BridgeConfig::new("orders", "memory://"),
        &registry,
        Arc::new(Echo),
        None,
    )
    .await
    .expect("start");

    broker
        .enqueue("orders", &b"{\"n\":1}"[..], Some("replies"))
        .expect("enqueue");
    for _ in 0..200 {
        if broker.depth("replies") == Some(1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    endpoint.destroy().await.expect("destroy");

    let snapshot = snapshotter.snapshot().into_vec();
    assert_eq!(
        counter(&snapshot, qm::MESSAGES_CONSUMED, Some(("mode", "single"))),
        1
    );
    assert_eq!(counter(&snapshot, qm::REPLIES_PUBLISHED, None), 1);
}
