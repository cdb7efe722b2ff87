//! Redis后端集成测试，需要Docker：`cargo test -- --ignored`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;
use vmfleet_core::config::RedisConfig;
use vmfleet_core::models::{EnqueueOptions, QueueTier, Task, TaskEnvelope};
use vmfleet_core::traits::{EventBus, QueueStore, RegistryStore, StoreChange};
use vmfleet_infrastructure::{RedisEventBus, RedisQueueStore, RedisRegistryStore};
use vmfleet_testing_utils::mocks::RecordingEventHandler;

struct RedisSetup {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    config: RedisConfig,
}

impl RedisSetup {
    async fn new() -> Result<Self> {
        let container = Redis::default().with_tag("7-alpine").start().await?;
        let port = container.get_host_port_ipv4(6379).await?;
        let config = RedisConfig {
            url: format!("redis://127.0.0.1:{port}"),
            key_prefix: "vmfleet-test".to_string(),
            connection_timeout_seconds: 10,
        };
        Ok(Self { container, config })
    }
}

fn envelope(id: &str, tier: QueueTier) -> TaskEnvelope {
    TaskEnvelope::new(
        Task::new(id, "noop", serde_json::json!({ "id": id })),
        &EnqueueOptions::default().with_tier(tier),
    )
}

#[tokio::test]
#[ignore]
async fn test_redis_queue_store_lifecycle() -> Result<()> {
    let setup = RedisSetup::new().await?;
    let store = RedisQueueStore::new(&setup.config).await?;
    let lease = Duration::from_secs(30);

    assert!(store.push(&envelope("low", QueueTier::Low)).await?);
    assert!(store.push(&envelope("critical", QueueTier::Critical)).await?);
    assert!(!store.push(&envelope("critical", QueueTier::Critical)).await?);

    let first = store.pop_lease(None, lease).await?.expect("critical task");
    assert_eq!(first.envelope.task.id, "critical");
    assert!(!store.push(&envelope("critical", QueueTier::Critical)).await?);

    let mut retried = first.envelope.clone();
    retried.record_failure("boom");
    retried.not_before = Some(chrono::Utc::now() + chrono::Duration::milliseconds(300));
    assert!(store.retry(&first.lease, &retried).await?);
    assert!(!store.ack(&first.lease).await?);

    let second = store.pop_lease(None, lease).await?.expect("low task");
    assert_eq!(second.envelope.task.id, "low");
    assert!(store.ack(&second.lease).await?);

    assert!(store.pop_lease(None, lease).await?.is_none());
    assert_eq!(store.stats().await?.delayed, 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let third = store.pop_lease(None, lease).await?.expect("retried task");
    assert_eq!(third.envelope.task.id, "critical");
    assert_eq!(third.envelope.attempts, 1);

    let mut dead = third.envelope.clone();
    dead.record_failure("fatal");
    assert!(store.fail(&third.lease, &dead).await?);
    assert_eq!(store.failed().await?.len(), 1);
    assert_eq!(store.purge_failed().await?, 1);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_redis_queue_store_expired_leases() -> Result<()> {
    let setup = RedisSetup::new().await?;
    let store = RedisQueueStore::new(&setup.config).await?;

    store.push(&envelope("t1", QueueTier::Default)).await?;
    let leased = store
        .pop_lease(None, Duration::from_millis(50))
        .await?
        .expect("task");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let expired = store.expired_leases(chrono::Utc::now()).await?;
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].lease.lease_id, leased.lease.lease_id);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_redis_queue_store_targeted_partition() -> Result<()> {
    let setup = RedisSetup::new().await?;
    let store = RedisQueueStore::new(&setup.config).await?;
    let lease = Duration::from_secs(30);

    let targeted = TaskEnvelope::new(
        Task::new("delete-sb-1", "sandbox-delete", serde_json::json!({ "sandbox_id": "sb-1" })),
        &EnqueueOptions::default().with_target_worker("worker-1"),
    );
    assert!(store.push(&targeted).await?);
    assert_eq!(store.stats().await?.targeted, 1);

    assert!(store.pop_lease(Some("worker-2"), lease).await?.is_none());
    assert!(store.pop_lease(None, lease).await?.is_none());

    let owned = store
        .pop_lease(Some("worker-1"), lease)
        .await?
        .expect("targeted task");
    assert_eq!(owned.envelope.target_worker.as_deref(), Some("worker-1"));

    // 退避结束后回到同一个私有分区
    let mut retried = owned.envelope.clone();
    retried.record_failure("busy");
    retried.not_before = Some(chrono::Utc::now() + chrono::Duration::milliseconds(200));
    assert!(store.retry(&owned.lease, &retried).await?);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(store.pop_lease(Some("worker-2"), lease).await?.is_none());
    let again = store
        .pop_lease(Some("worker-1"), lease)
        .await?
        .expect("retried targeted task");
    assert!(store.ack(&again.lease).await?);
    assert_eq!(store.stats().await?.total_pending(), 0);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_redis_registry_store_ttl_and_watch() -> Result<()> {
    let setup = RedisSetup::new().await?;
    let store = RedisRegistryStore::new(&setup.config).await?;
    let mut changes = store.watch().await?;

    store
        .put("workers/w1", "{\"id\":\"w1\"}", Some(Duration::from_millis(200)))
        .await?;
    store.put("workers/w2", "{\"id\":\"w2\"}", None).await?;

    let change = tokio::time::timeout(Duration::from_secs(2), changes.recv()).await??;
    assert_eq!(change.key(), "workers/w1");

    let listed = store.list("workers/").await?;
    assert_eq!(listed.len(), 2);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let listed = store.list("workers/").await?;
    assert_eq!(
        listed,
        vec![("workers/w2".to_string(), "{\"id\":\"w2\"}".to_string())]
    );

    assert!(store.delete("workers/w2").await?);
    let expected = StoreChange::Deleted {
        key: "workers/w2".to_string(),
    };
    let mut saw_delete = false;
    while let Ok(Ok(change)) = tokio::time::timeout(Duration::from_secs(2), changes.recv()).await {
        if change == expected {
            saw_delete = true;
            break;
        }
    }
    assert!(saw_delete);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_redis_event_bus_across_instances() -> Result<()> {
    let setup = RedisSetup::new().await?;
    let publisher = RedisEventBus::new(&setup.config).await?;
    let subscriber = RedisEventBus::new(&setup.config).await?;

    let exact = Arc::new(RecordingEventHandler::new());
    let wildcard = Arc::new(RecordingEventHandler::new());
    let exact_id = subscriber.subscribe("vm.ready", exact.clone()).await?;
    subscriber.subscribe("vm.*", wildcard.clone()).await?;

    publisher
        .publish("vm.ready", serde_json::json!({ "n": 1 }))
        .await?;
    publisher
        .publish("vm.deleted", serde_json::json!({ "n": 2 }))
        .await?;

    assert!(exact.wait_for(1, Duration::from_secs(3)).await);
    assert!(wildcard.wait_for(2, Duration::from_secs(3)).await);

    subscriber.unsubscribe("vm.ready", &exact_id).await?;
    assert_eq!(subscriber.subscriber_count("vm.ready").await, 0);
    assert!(subscriber.unsubscribe("vm.ready", &exact_id).await.is_err());

    publisher
        .publish("vm.ready", serde_json::json!({ "n": 3 }))
        .await?;
    assert!(wildcard.wait_for(3, Duration::from_secs(3)).await);
    assert_eq!(exact.count(), 1);

    subscriber.shutdown().await?;
    publisher.shutdown().await?;
    Ok(())
}
