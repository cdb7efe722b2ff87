use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use vmfleet_core::models::{Event, SubscriptionId};
use vmfleet_core::traits::{EventBus, EventHandler};
use vmfleet_errors::{FleetError, FleetResult};

use super::fanout::LocalFanout;

/// 进程内事件总线
pub struct InMemoryEventBus {
    fanout: LocalFanout,
    closed: AtomicBool,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self {
            fanout: LocalFanout::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> FleetResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FleetError::InvalidState("事件总线已关闭".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> FleetResult<Event> {
        self.ensure_open()?;
        let event = Event::new(topic, payload);
        let delivered = self.fanout.dispatch(event.clone()).await;
        metrics::counter!("vmfleet_events_published_total").increment(1);
        debug!("发布事件 {} ({})，投递给 {} 个订阅者", event.topic, event.id, delivered);
        Ok(event)
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> FleetResult<SubscriptionId> {
        self.ensure_open()?;
        let (id, _) = self.fanout.add(topic, handler).await;
        Ok(id)
    }

    async fn unsubscribe(&self, topic: &str, id: &str) -> FleetResult<()> {
        self.fanout.remove(topic, id).await?;
        Ok(())
    }

    async fn subscriber_count(&self, topic: &str) -> usize {
        self.fanout.count(topic).await
    }

    async fn shutdown(&self) -> FleetResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.fanout.clear().await;
        info!("内存事件总线已关闭");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vmfleet_core::models::topics;
    use vmfleet_testing_utils::mocks::{FailingEventHandler, RecordingEventHandler};

    #[tokio::test]
    async fn test_failing_subscriber_does_not_block_others() {
        let bus = InMemoryEventBus::new();
        let failing = Arc::new(FailingEventHandler::new());
        let recorder = Arc::new(RecordingEventHandler::new());

        bus.subscribe(topics::VM_READY, failing.clone()).await.unwrap();
        bus.subscribe(topics::VM_READY, recorder.clone()).await.unwrap();

        bus.publish(topics::VM_READY, serde_json::json!({"sandbox_id": "sb-1"}))
            .await
            .unwrap();

        assert!(recorder.wait_for(1, Duration::from_secs(2)).await);
        assert_eq!(failing.calls(), 1);
        assert_eq!(recorder.events()[0].payload["sandbox_id"], "sb-1");
    }

    #[tokio::test]
    async fn test_panicking_subscriber_keeps_receiving() {
        let bus = InMemoryEventBus::new();
        let panicking = Arc::new(FailingEventHandler::panicking());
        let recorder = Arc::new(RecordingEventHandler::new());

        bus.subscribe("task.*", panicking.clone()).await.unwrap();
        bus.subscribe("task.*", recorder.clone()).await.unwrap();

        for _ in 0..3 {
            bus.publish(topics::TASK_COMPLETED, serde_json::json!({}))
                .await
                .unwrap();
        }

        assert!(recorder.wait_for(3, Duration::from_secs(2)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(panicking.calls(), 3);
    }

    #[tokio::test]
    async fn test_per_subscriber_order_preserved() {
        let bus = InMemoryEventBus::new();
        let slow = Arc::new(RecordingEventHandler::with_delay(Duration::from_millis(5)));
        bus.subscribe(topics::VM_COMMAND_COMPLETED, slow.clone())
            .await
            .unwrap();

        for i in 0..20 {
            bus.publish(topics::VM_COMMAND_COMPLETED, serde_json::json!({ "seq": i }))
                .await
                .unwrap();
        }

        assert!(slow.wait_for(20, Duration::from_secs(5)).await);
        let seqs: Vec<i64> = slow
            .events()
            .iter()
            .map(|e| e.payload["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_wildcard_subscription() {
        let bus = InMemoryEventBus::new();
        let recorder = Arc::new(RecordingEventHandler::new());
        bus.subscribe(topics::VM_ALL, recorder.clone()).await.unwrap();

        bus.publish(topics::VM_READY, serde_json::json!({})).await.unwrap();
        bus.publish(topics::TASK_FAILED, serde_json::json!({})).await.unwrap();
        bus.publish(topics::VM_DELETED, serde_json::json!({})).await.unwrap();

        assert!(recorder.wait_for(2, Duration::from_secs(2)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let topics_seen: Vec<String> = recorder.events().into_iter().map(|e| e.topic).collect();
        assert_eq!(topics_seen, vec![topics::VM_READY, topics::VM_DELETED]);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_returns_not_found() {
        let bus = InMemoryEventBus::new();
        let recorder = Arc::new(RecordingEventHandler::new());

        let err = bus.unsubscribe("vm.ready", "missing").await.unwrap_err();
        assert!(err.is_not_found());

        let id = bus.subscribe("vm.ready", recorder).await.unwrap();
        let err = bus.unsubscribe("vm.ready", "missing").await.unwrap_err();
        assert!(err.is_not_found());
        let err = bus.unsubscribe("vm.deleted", &id).await.unwrap_err();
        assert!(err.is_not_found());

        bus.unsubscribe("vm.ready", &id).await.unwrap();
        assert_eq!(bus.subscriber_count("vm.ready").await, 0);
        assert!(bus.unsubscribe("vm.ready", &id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unsubscribed_handler_gets_no_new_events() {
        let bus = InMemoryEventBus::new();
        let recorder = Arc::new(RecordingEventHandler::new());
        let id = bus.subscribe("vm.ready", recorder.clone()).await.unwrap();

        bus.publish("vm.ready", serde_json::json!({"n": 1})).await.unwrap();
        assert!(recorder.wait_for(1, Duration::from_secs(2)).await);

        bus.unsubscribe("vm.ready", &id).await.unwrap();
        bus.publish("vm.ready", serde_json::json!({"n": 2})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let bus = InMemoryEventBus::new();
        let recorder = Arc::new(RecordingEventHandler::new());
        bus.subscribe("vm.ready", recorder.clone()).await.unwrap();

        bus.shutdown().await.unwrap();
        assert_eq!(bus.subscriber_count("vm.ready").await, 0);
        assert!(bus.publish("vm.ready", serde_json::json!({})).await.is_err());
        assert!(bus.subscribe("vm.ready", recorder).await.is_err());
        bus.shutdown().await.unwrap();
    }
}
