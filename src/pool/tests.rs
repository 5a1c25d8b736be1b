use std::{sync::Arc, time::Duration};

use rstest::{fixture, rstest};

use super::*;
use crate::transport::memory::MemoryBroker;

#[fixture]
fn broker() -> MemoryBroker { MemoryBroker::new() }

fn pooled(broker: &MemoryBroker, max_size: usize) -> ConnectionPool {
    ConnectionPool::new(
        Arc::new(broker.backend()),
        "memory://",
        &PoolConfig {
            enabled: true,
            max_size,
            wait_timeout: Duration::from_millis(50),
        },
    )
}

#[rstest]
#[tokio::test]
async fn released_objects_are_reused(broker: MemoryBroker) {
    let pool = pooled(&broker, 2);
    let lease = pool.borrow(None).await.expect("borrow");
    let first = lease.object().id();
    lease.release().await;

    let again = pool.borrow(None).await.expect("borrow");
    assert_eq!(again.object().id(), first);
    assert_eq!(broker.stats().connections_opened, 1);
    again.release().await;
    assert_eq!(pool.status().idle, 1);
}

#[rstest]
#[tokio::test]
async fn invalidated_object_is_never_reissued(broker: MemoryBroker) {
    let pool = pooled(&broker, 1);
    let lease = pool.borrow(None).await.expect("borrow");
    let first = lease.object().id();
    lease.invalidate().await;

    for _ in 0..3 {
        let next = pool.borrow(None).await.expect("borrow");
        assert_ne!(next.object().id(), first);
        next.release().await;
    }
    assert_eq!(pool.status().idle, 1);
}

#[rstest]
#[tokio::test]
async fn idle_object_failing_validation_is_replaced(broker: MemoryBroker) {
    let pool = pooled(&broker, 1);
    let lease = pool.borrow(None).await.expect("borrow");
    let first = lease.object().id();
    lease.release().await;

    broker.fail_next_probes(1);
    let next = pool.borrow(None).await.expect("borrow");
    assert_ne!(next.object().id(), first);
    assert_eq!(broker.stats().connections_closed, 1);
    next.release().await;
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn exhaustion_surfaces_as_error(broker: MemoryBroker) {
    let pool = pooled(&broker, 1);
    let held = pool.borrow(None).await.expect("borrow");

    let err = pool.borrow(None).await.expect_err("pool is exhausted");
    assert!(matches!(
        err,
        BridgeError::PoolExhausted { waited: Some(w) } if w == Duration::from_millis(50)
    ));
    held.release().await;
}

#[rstest]
#[tokio::test]
async fn unpooled_leases_open_and_close_one_object(broker: MemoryBroker) {
    let pool = ConnectionPool::new(Arc::new(broker.backend()), "memory://", &PoolConfig::default());
    assert!(!pool.is_pooled());

    let lease = pool.borrow(None).await.expect("borrow");
    assert_eq!(broker.open_connections(), 1);
    lease.release().await;

    let stats = broker.stats();
    assert_eq!(stats.connections_opened, 1);
    assert_eq!(stats.connections_closed, 1);
}

#[rstest]
#[tokio::test]
async fn connect_failure_releases_the_permit(broker: MemoryBroker) {
    let pool = pooled(&broker, 1);
    broker.fail_next_connects(1);
    assert!(pool.borrow(None).await.is_err());

    let lease = pool.borrow(None).await.expect("permit was returned");
    lease.release().await;
}

#[rstest]
#[tokio::test]
async fn closing_destroys_idle_objects(broker: MemoryBroker) {
    let pool = pooled(&broker, 2);
    let a = pool.borrow(None).await.expect("borrow");
    let b = pool.borrow(None).await.expect("borrow");
    a.release().await;
    b.release().await;

    pool.close().await.expect("close");

    assert_eq!(broker.open_connections(), 0);
    assert!(matches!(pool.borrow(None).await, Err(BridgeError::PoolClosed)));
}

#[rstest]
#[tokio::test]
async fn dropped_lease_returns_object_to_idle_set(broker: MemoryBroker) {
    let pool = pooled(&broker, 1);
    let lease = pool.borrow(None).await.expect("borrow");
    let first = lease.object().id();
    assert_eq!(pool.status().in_use, 1);

    drop(lease);

    assert_eq!(pool.status(), PoolStatus {
        max_size: Some(1),
        idle: 1,
        in_use: 0,
    });
    let again = pool.borrow(None).await.expect("permit was returned");
    assert_eq!(again.object().id(), first);
    again.release().await;
}

#[rstest]
#[tokio::test]
async fn releasing_after_close_destroys_the_object(broker: MemoryBroker) {
    let pool = pooled(&broker, 1);
    let lease = pool.borrow(None).await.expect("borrow");
    pool.close().await.expect("close");

    lease.release().await;

    assert_eq!(broker.open_connections(), 0);
    assert_eq!(pool.status().idle, 0);
    assert_eq!(pool.status().in_use, 0);
}
