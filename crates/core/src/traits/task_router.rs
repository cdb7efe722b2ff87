use async_trait::async_trait;

use crate::models::Task;
use crate::FleetResult;

/// 为没有指定目标的任务选择所属Worker
///
/// 分发队列在入队时和公共任务被领取时各询问一次。操作某个Worker本地资源的任务
/// 应当路由到该Worker，其余任务返回 `None`。
#[async_trait]
pub trait TaskRouter: Send + Sync {
    async fn route(&self, task: &Task) -> FleetResult<Option<String>>;
}
