use std::sync::Arc;

use async_trait::async_trait;

use crate::models::{Event, SubscriptionId};
use crate::FleetResult;

/// 事件处理器
///
/// 处理器返回的错误只会被记录，事件不会重新投递。
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> FleetResult<()>;

    fn name(&self) -> &str {
        "anonymous"
    }
}

/// 按主题发布/订阅的事件总线
///
/// 每个订阅者独立并发地接收事件，慢订阅者不会阻塞发布者或其他订阅者；
/// 同一订阅者按发布顺序接收同一主题的事件。
#[async_trait]
pub trait EventBus: Send + Sync {
    /// 发布事件到所有当前订阅者，不等待处理器执行
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> FleetResult<Event>;

    /// 订阅主题，支持 `vm.*` 形式的尾部通配符
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> FleetResult<SubscriptionId>;

    /// 取消订阅，主题或ID未知时返回 `NotFound`
    async fn unsubscribe(&self, topic: &str, id: &str) -> FleetResult<()>;

    async fn subscriber_count(&self, topic: &str) -> usize;

    /// 关闭总线并移除全部订阅
    async fn shutdown(&self) -> FleetResult<()>;

    fn backend_name(&self) -> &'static str;
}
