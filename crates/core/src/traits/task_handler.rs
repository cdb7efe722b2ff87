//! 任务处理器接口定义
//!
//! 分发队列按任务类型把任务交给唯一注册的处理器。投递语义是至少一次：
//! 处理失败、panic或超时都会导致重新投递，因此处理器必须对同一任务ID
//! 幂等。队列本身不强制这一点。
//!
//! ## 实现自定义处理器
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use vmfleet_core::traits::{TaskContext, TaskHandler};
//! use vmfleet_core::{models::Task, FleetResult};
//!
//! pub struct EchoHandler;
//!
//! #[async_trait]
//! impl TaskHandler for EchoHandler {
//!     async fn handle(&self, task: &Task, _ctx: &TaskContext) -> FleetResult<serde_json::Value> {
//!         Ok(task.payload.clone())
//!     }
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{QueueTier, Task};
use crate::FleetResult;

/// 单次投递的上下文
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskContext {
    /// 第几次投递，从1开始
    pub delivery: u32,
    pub max_retry: u32,
    pub tier: QueueTier,
    /// 本次投递的超时时间
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl TaskContext {
    pub fn is_redelivery(&self) -> bool {
        self.delivery > 1
    }

    pub fn is_last_attempt(&self) -> bool {
        self.delivery > self.max_retry
    }
}

/// 任务处理器
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// 处理任务，成功时的返回值随 `task.completed` 事件发布
    async fn handle(&self, task: &Task, ctx: &TaskContext) -> FleetResult<serde_json::Value>;
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
