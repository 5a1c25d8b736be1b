use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use rstest::{fixture, rstest};

use super::*;
use crate::{
    error::{BridgeError, ServiceError},
    format::Format,
    service::CallbackService,
    transport::memory::MemoryBroker,
};

struct Echo;

#[async_trait]
impl CallbackService for Echo {
    async fn process_one(&self, request: Bytes) -> std::result::Result<Bytes, ServiceError> {
        Ok(request)
    }

    async fn process_merged(
        &self,
        requests: Vec<Bytes>,
        _format: Format,
    ) -> std::result::Result<Bytes, ServiceError> {
        Ok(Bytes::from(requests.concat()))
    }
}

#[fixture]
fn broker() -> MemoryBroker { MemoryBroker::new() }

fn resource_with(broker: &MemoryBroker, config: BridgeConfig) -> ConnectionResource {
    ConnectionResource::new(
        Arc::new(broker.backend()),
        Arc::new(config),
        0,
        Callbacks::new(Arc::new(Echo)),
    )
}

fn resource(broker: &MemoryBroker) -> ConnectionResource {
    resource_with(broker, BridgeConfig::new("orders", "memory://"))
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[rstest]
#[tokio::test]
async fn connect_declares_queue_and_applies_prefetch(broker: MemoryBroker) {
    let mut config = BridgeConfig::new("orders", "memory://").with_prefetch(25);
    config.declare.expires = Some(Duration::from_secs(30));
    let resource = resource_with(&broker, config);

    resource.connect().await.expect("connect");

    assert_eq!(resource.phase(), ResourcePhase::Connected);
    let spec = broker.queue_spec("orders").expect("queue declared");
    assert!(spec.durable);
    assert_eq!(spec.expires, Some(Duration::from_secs(30)));
    assert_eq!(broker.last_prefetch(), Some(25));

    resource.connect().await.expect("second connect is a no-op");
    assert_eq!(broker.stats().connections_opened, 1);
    resource.destroy().await.expect("destroy");
}

#[rstest]
#[tokio::test]
async fn failed_connect_tears_down_partial_state(broker: MemoryBroker) {
    let resource = resource(&broker);
    broker.fail_next_declares(1);

    let err = resource.connect().await.expect_err("declare fails");

    assert!(matches!(err, BridgeError::Transport(TransportError::Injected { .. })));
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(resource.phase(), ResourcePhase::Unconnected);

    resource.connect().await.expect("retry succeeds");
    resource.destroy().await.expect("destroy");
}

#[rstest]
#[tokio::test]
async fn destroyed_resource_performs_no_broker_operations(broker: MemoryBroker) {
    let resource = resource(&broker);
    resource.connect().await.expect("connect");
    resource.destroy().await.expect("destroy");
    let before = broker.stats();

    resource.connect().await.expect("no-op");
    resource.reconnect().await.expect("no-op");
    resource.destroy().await.expect("idempotent");

    assert_eq!(broker.stats(), before);
    assert_eq!(resource.phase(), ResourcePhase::Destroyed);
    assert!(!resource.is_healthy().await);
    assert_eq!(broker.open_connections(), 0);
}

#[rstest]
#[tokio::test]
async fn health_check_repairs_a_failed_probe_once(broker: MemoryBroker) {
    let resource = resource(&broker);
    resource.connect().await.expect("connect");
    broker.fail_next_probes(1);

    assert!(resource.is_healthy().await);

    assert_eq!(resource.reconnect_count(), 1);
    let stats = broker.stats();
    assert_eq!(stats.connections_opened, 2);
    assert_eq!(stats.connections_closed, 1);
    assert_eq!(resource.phase(), ResourcePhase::Connected);
    resource.destroy().await.expect("destroy");
}

#[rstest]
#[tokio::test]
async fn broker_cancellation_triggers_reconnect(broker: MemoryBroker) {
    let resource = resource(&broker);
    resource.connect().await.expect("connect");
    tokio::task::yield_now().await;

    broker.delete_queue("orders");

    eventually(|| resource.reconnect_count() == 1).await;
    assert!(broker.has_queue("orders"));
    assert_eq!(resource.phase(), ResourcePhase::Connected);
    resource.destroy().await.expect("destroy");
}

#[rstest]
#[tokio::test]
async fn cancellation_without_recovery_waits_for_health_check(broker: MemoryBroker) {
    let config = BridgeConfig::new("orders", "memory://").with_cancel_recovery(false);
    let resource = resource_with(&broker, config);
    resource.connect().await.expect("connect");
    tokio::task::yield_now().await;

    broker.delete_queue("orders");

    eventually(|| resource.phase() == ResourcePhase::Cancelled).await;
    assert_eq!(resource.reconnect_count(), 0);
    assert!(!broker.has_queue("orders"));

    assert!(resource.is_healthy().await);
    assert_eq!(resource.reconnect_count(), 1);
    assert!(broker.has_queue("orders"));
    resource.destroy().await.expect("destroy");
}

#[rstest]
#[tokio::test]
async fn connected_resource_serves_requests(broker: MemoryBroker) {
    broker.declare("replies", crate::transport::QueueSpec::default());
    let resource = resource(&broker);
    resource.connect().await.expect("connect");

    broker
        .enqueue("orders", &b"{\"order\":7}"[..], Some("replies"))
        .expect("enqueue");

    eventually(|| broker.depth("replies") == Some(1)).await;
    let replies = broker.take("replies");
    assert_eq!(replies[0].body, Bytes::from_static(b"{\"order\":7}"));

    resource.destroy().await.expect("destroy");
    assert_eq!(broker.open_connections(), 0);
}

#[rstest]
#[tokio::test]
async fn close_allows_connecting_again(broker: MemoryBroker) {
    let resource = resource(&broker);
    resource.connect().await.expect("connect");
    resource.close().await.expect("close");
    assert_eq!(resource.phase(), ResourcePhase::Closed);

    resource.connect().await.expect("connect again");
    assert_eq!(resource.phase(), ResourcePhase::Connected);
    resource.destroy().await.expect("destroy");
}
