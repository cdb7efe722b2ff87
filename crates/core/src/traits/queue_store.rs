use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{QueueTier, TaskEnvelope};
use crate::FleetResult;

/// 一次投递的租约
///
/// `lease_id` 区分同一任务的不同投递，迟到的确认不会误删新的租约。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub task_id: String,
    pub lease_id: String,
    pub deadline: DateTime<Utc>,
}

/// 带租约的任务
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedTask {
    pub envelope: TaskEnvelope,
    pub lease: Lease,
}

/// 队列存储统计
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueStoreStats {
    /// 公共分区中可以立即投递的任务
    pub pending: BTreeMap<QueueTier, usize>,
    /// 定向给某个Worker、可以立即投递的任务
    #[serde(default)]
    pub targeted: usize,
    /// 处于重试退避中的任务
    pub delayed: usize,
    pub leased: usize,
    pub failed: usize,
}

impl QueueStoreStats {
    pub fn total_pending(&self) -> usize {
        self.pending.values().sum::<usize>() + self.targeted + self.delayed
    }
}

/// 分发队列的持久化存储接口
///
/// 要求原子入队、带租约的至少一次弹出、重试计数和按层级分区。
/// 层级之间严格按 `QueueTier::ALL` 的顺序弹出。
///
/// 带 `target_worker` 的任务进入该Worker的私有分区，只会被以同一ID弹出的消费者领取；
/// 同一层级内私有分区先于公共分区。
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// 持久化任务，同一ID已在队列或租约中时返回 `false`
    async fn push(&self, envelope: &TaskEnvelope) -> FleetResult<bool>;

    /// 按层级顺序弹出一个已到期的任务并加上租约
    ///
    /// `worker_id` 为 `None` 时只弹出公共任务。
    async fn pop_lease(
        &self,
        worker_id: Option<&str>,
        lease_duration: Duration,
    ) -> FleetResult<Option<LeasedTask>>;

    /// 确认任务完成并删除，租约不匹配时返回 `false`
    async fn ack(&self, lease: &Lease) -> FleetResult<bool>;

    /// 释放租约并按 `envelope.not_before` 重新入队
    async fn retry(&self, lease: &Lease, envelope: &TaskEnvelope) -> FleetResult<bool>;

    /// 释放租约并移入终止失败集合
    async fn fail(&self, lease: &Lease, envelope: &TaskEnvelope) -> FleetResult<bool>;

    /// 列出已过期的租约（只读，由调用方决定重试或失败）
    async fn expired_leases(&self, now: DateTime<Utc>) -> FleetResult<Vec<LeasedTask>>;

    /// 终止失败的任务
    async fn failed(&self) -> FleetResult<Vec<TaskEnvelope>>;

    /// 删除终止失败记录
    async fn purge_failed(&self) -> FleetResult<usize>;

    async fn stats(&self) -> FleetResult<QueueStoreStats>;

    fn backend_name(&self) -> &'static str;
}
