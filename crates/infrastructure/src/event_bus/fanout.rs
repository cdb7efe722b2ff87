use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;
use vmfleet_core::models::{topic_matches, Event, SubscriptionId};
use vmfleet_core::traits::EventHandler;
use vmfleet_errors::{FleetError, FleetResult};

struct Subscriber {
    id: SubscriptionId,
    sender: mpsc::UnboundedSender<Arc<Event>>,
    task: JoinHandle<()>,
}

type TopicSubscribers = Arc<Mutex<Vec<Subscriber>>>;

/// 进程内扇出：订阅主题 -> 订阅者列表
///
/// 外层读写锁只在新增或删除主题时写锁，同一主题内的订阅者由各自的互斥锁保护。
pub(crate) struct LocalFanout {
    topics: RwLock<HashMap<String, TopicSubscribers>>,
}

impl LocalFanout {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// 添加订阅者，返回订阅ID以及该主题此前是否没有订阅者
    pub async fn add(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> (SubscriptionId, bool) {
        let id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = spawn_delivery(topic.to_string(), id.clone(), handler, receiver);

        let mut topics = self.topics.write().await;
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();

        let mut subscribers = entry.lock().await;
        let first = subscribers.is_empty();
        subscribers.push(Subscriber {
            id: id.clone(),
            sender,
            task,
        });

        debug!("主题 {} 新增订阅 {}", topic, id);
        (id, first)
    }

    /// 移除订阅者，返回该主题是否已没有订阅者
    ///
    /// 已经进入通道的事件仍会投递完毕，之后投递任务退出。
    pub async fn remove(&self, topic: &str, id: &str) -> FleetResult<bool> {
        let mut topics = self.topics.write().await;
        let entry = topics
            .get(topic)
            .cloned()
            .ok_or_else(|| FleetError::subscription_not_found(format!("{topic}/{id}")))?;

        let mut subscribers = entry.lock().await;
        let position = subscribers
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| FleetError::subscription_not_found(format!("{topic}/{id}")))?;
        subscribers.remove(position);

        let empty = subscribers.is_empty();
        if empty {
            topics.remove(topic);
        }
        debug!("主题 {} 移除订阅 {}", topic, id);
        Ok(empty)
    }

    /// 投递给所有匹配的订阅主题
    pub async fn dispatch(&self, event: Event) -> usize {
        let event = Arc::new(event);
        let matching: Vec<TopicSubscribers> = {
            let topics = self.topics.read().await;
            topics
                .iter()
                .filter(|(pattern, _)| topic_matches(pattern, &event.topic))
                .map(|(_, subs)| subs.clone())
                .collect()
        };

        let mut delivered = 0;
        for subscribers in matching {
            delivered += Self::send_all(&subscribers, &event).await;
        }
        delivered
    }

    /// 只投递给某个订阅主题下的订阅者
    pub async fn dispatch_to(&self, topic: &str, event: Event) -> usize {
        let subscribers = {
            let topics = self.topics.read().await;
            match topics.get(topic) {
                Some(subs) => subs.clone(),
                None => return 0,
            }
        };
        Self::send_all(&subscribers, &Arc::new(event)).await
    }

    async fn send_all(subscribers: &TopicSubscribers, event: &Arc<Event>) -> usize {
        let subscribers = subscribers.lock().await;
        subscribers
            .iter()
            .filter(|s| s.sender.send(event.clone()).is_ok())
            .count()
    }

    pub async fn count(&self, topic: &str) -> usize {
        let entry = self.topics.read().await.get(topic).cloned();
        match entry {
            Some(subs) => subs.lock().await.len(),
            None => 0,
        }
    }

    pub async fn topics(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }

    /// 移除全部订阅并等待投递任务把已入队的事件处理完
    pub async fn clear(&self) {
        let drained: Vec<TopicSubscribers> =
            self.topics.write().await.drain().map(|(_, v)| v).collect();
        for subscribers in drained {
            let subscribers: Vec<Subscriber> = subscribers.lock().await.drain(..).collect();
            for subscriber in subscribers {
                drop(subscriber.sender);
                if let Err(e) = subscriber.task.await {
                    warn!("订阅 {} 的投递任务异常退出: {}", subscriber.id, e);
                }
            }
        }
    }
}

fn spawn_delivery(
    topic: String,
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
    mut receiver: mpsc::UnboundedReceiver<Arc<Event>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            let outcome = AssertUnwindSafe(handler.handle_event(&event))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    metrics::counter!("vmfleet_event_handler_errors_total").increment(1);
                    warn!(
                        "事件处理器 {} 处理 {} 失败 (订阅 {}/{}): {}",
                        handler.name(),
                        event.topic,
                        topic,
                        id,
                        e
                    );
                }
                Err(_) => {
                    metrics::counter!("vmfleet_event_handler_errors_total").increment(1);
                    error!(
                        "事件处理器 {} 处理 {} 时发生panic (订阅 {}/{})",
                        handler.name(),
                        event.topic,
                        topic,
                        id
                    );
                }
            }
        }
        debug!("订阅 {}/{} 的投递任务退出", topic, id);
    })
}
