use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vmfleet_core::config::RedisConfig;
use vmfleet_core::models::{Event, SubscriptionId};
use vmfleet_core::traits::{EventBus, EventHandler};
use vmfleet_errors::{FleetError, FleetResult};

use super::fanout::LocalFanout;
use crate::redis_support::{self, redis_error, KeySpace};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

struct Listener {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// 基于Redis发布/订阅的跨进程事件总线
///
/// 事件发布到频道 `{prefix}:events:{topic}`。每个有本地订阅者的主题对应一个
/// 监听任务（通配符主题使用PSUBSCRIBE），最后一个订阅者退订时取消该任务。
pub struct RedisEventBus {
    client: redis::Client,
    conn: ConnectionManager,
    keys: KeySpace,
    fanout: Arc<LocalFanout>,
    listeners: Mutex<HashMap<String, Listener>>,
    shutdown: CancellationToken,
}

impl RedisEventBus {
    pub async fn new(config: &RedisConfig) -> FleetResult<Self> {
        let (client, conn) = redis_support::connect(config).await?;
        info!("Redis事件总线已连接，前缀: {}", config.key_prefix);
        Ok(Self {
            client,
            conn,
            keys: KeySpace::new(config.key_prefix.clone()),
            fanout: Arc::new(LocalFanout::new()),
            listeners: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    fn channel(&self, topic: &str) -> String {
        self.keys.key(&format!("events:{topic}"))
    }

    fn is_pattern(topic: &str) -> bool {
        topic == "*" || topic.ends_with(".*")
    }

    async fn start_listener(&self, topic: &str) -> FleetResult<Listener> {
        let cancel = self.shutdown.child_token();
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(run_listener(
            self.client.clone(),
            self.channel(topic),
            topic.to_string(),
            self.fanout.clone(),
            cancel.clone(),
            ready_tx,
        ));

        match ready_rx.await {
            Ok(Ok(())) => Ok(Listener { cancel, handle }),
            Ok(Err(e)) => {
                cancel.cancel();
                Err(e)
            }
            Err(_) => Err(FleetError::Internal(format!("主题 {topic} 的监听任务提前退出"))),
        }
    }
}

async fn subscribe_channel(
    client: &redis::Client,
    channel: &str,
    pattern: bool,
) -> FleetResult<redis::aio::PubSub> {
    let mut pubsub = client.get_async_pubsub().await.map_err(redis_error)?;
    if pattern {
        pubsub.psubscribe(channel).await.map_err(redis_error)?;
    } else {
        pubsub.subscribe(channel).await.map_err(redis_error)?;
    }
    Ok(pubsub)
}

async fn run_listener(
    client: redis::Client,
    channel: String,
    topic: String,
    fanout: Arc<LocalFanout>,
    cancel: CancellationToken,
    ready: oneshot::Sender<FleetResult<()>>,
) {
    let pattern = RedisEventBus::is_pattern(&topic);
    let mut ready = Some(ready);

    while !cancel.is_cancelled() {
        let mut pubsub = match subscribe_channel(&client, &channel, pattern).await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(e));
                    return;
                }
                warn!("重新订阅频道 {} 失败: {}", channel, e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                }
            }
        };

        if let Some(ready) = ready.take() {
            let _ = ready.send(Ok(()));
        }
        debug!("开始监听频道 {}", channel);

        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("停止监听频道 {}", channel);
                    return;
                }
                message = messages.next() => {
                    let Some(message) = message else {
                        warn!("频道 {} 的连接已断开，准备重连", channel);
                        break;
                    };
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!("读取频道 {} 的消息失败: {}", channel, e);
                            continue;
                        }
                    };
                    match Event::deserialize(&payload) {
                        Ok(event) => {
                            fanout.dispatch_to(&topic, event).await;
                        }
                        Err(e) => {
                            metrics::counter!("vmfleet_events_malformed_total").increment(1);
                            error!("频道 {} 收到无法解析的事件: {}", channel, e);
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> FleetResult<Event> {
        if self.shutdown.is_cancelled() {
            return Err(FleetError::InvalidState("事件总线已关闭".to_string()));
        }

        let event = Event::new(topic, payload);
        let body = event.serialize()?;
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(self.channel(topic))
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                metrics::counter!("vmfleet_event_publish_errors_total").increment(1);
                redis_error(e)
            })?;

        metrics::counter!("vmfleet_events_published_total").increment(1);
        debug!("发布事件 {} ({})，{} 个Redis订阅连接", event.topic, event.id, receivers);
        Ok(event)
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> FleetResult<SubscriptionId> {
        if self.shutdown.is_cancelled() {
            return Err(FleetError::InvalidState("事件总线已关闭".to_string()));
        }

        let mut listeners = self.listeners.lock().await;
        if !listeners.contains_key(topic) {
            let listener = self.start_listener(topic).await?;
            listeners.insert(topic.to_string(), listener);
        }
        let (id, _) = self.fanout.add(topic, handler).await;
        Ok(id)
    }

    async fn unsubscribe(&self, topic: &str, id: &str) -> FleetResult<()> {
        let mut listeners = self.listeners.lock().await;
        let now_empty = self.fanout.remove(topic, id).await?;
        if now_empty {
            if let Some(listener) = listeners.remove(topic) {
                listener.cancel.cancel();
                if let Err(e) = listener.handle.await {
                    warn!("主题 {} 的监听任务异常退出: {}", topic, e);
                }
                debug!("主题 {} 已无订阅者，监听任务已停止", topic);
            }
        }
        Ok(())
    }

    async fn subscriber_count(&self, topic: &str) -> usize {
        self.fanout.count(topic).await
    }

    async fn shutdown(&self) -> FleetResult<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();

        let listeners: Vec<(String, Listener)> = self.listeners.lock().await.drain().collect();
        for (topic, listener) in listeners {
            if let Err(e) = listener.handle.await {
                warn!("主题 {} 的监听任务异常退出: {}", topic, e);
            }
        }
        self.fanout.clear().await;
        info!("Redis事件总线已关闭");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

impl Drop for RedisEventBus {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
