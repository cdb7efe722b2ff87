use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmfleet_errors::FleetError;

/// 常用任务类型
pub mod task_types {
    pub const SANDBOX_CREATE: &str = "sandbox-create";
    pub const SANDBOX_EXECUTE: &str = "sandbox-execute";
    pub const SANDBOX_DELETE: &str = "sandbox-delete";
}

/// 提交到分发队列的任务
///
/// 任务ID由提交方提供，在重试之间保持不变。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        task_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            payload,
        }
    }

    /// 将负载解析为具体类型
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, FleetError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            FleetError::TaskExecution(format!("解析任务 {} 的负载失败: {e}", self.id))
        })
    }
}

/// 队列优先级层级，高层级在竞争时会被优先排空
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueueTier {
    Low,
    Default,
    High,
    Critical,
}

impl QueueTier {
    pub const CRITICAL_THRESHOLD: i32 = 90;
    pub const HIGH_THRESHOLD: i32 = 60;
    pub const DEFAULT_THRESHOLD: i32 = 20;

    /// 按优先级从高到低排列的全部层级
    pub const ALL: [QueueTier; 4] = [
        QueueTier::Critical,
        QueueTier::High,
        QueueTier::Default,
        QueueTier::Low,
    ];

    /// 数值优先级到层级的固定阈值映射
    pub fn from_priority(priority: i32) -> Self {
        if priority >= Self::CRITICAL_THRESHOLD {
            QueueTier::Critical
        } else if priority >= Self::HIGH_THRESHOLD {
            QueueTier::High
        } else if priority >= Self::DEFAULT_THRESHOLD {
            QueueTier::Default
        } else {
            QueueTier::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueTier::Critical => "critical",
            QueueTier::High => "high",
            QueueTier::Default => "default",
            QueueTier::Low => "low",
        }
    }
}

impl fmt::Display for QueueTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueTier {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(QueueTier::Critical),
            "high" => Ok(QueueTier::High),
            "default" => Ok(QueueTier::Default),
            "low" => Ok(QueueTier::Low),
            _ => Err(FleetError::config_error(format!(
                "不支持的队列层级: {s}，支持的层级: critical, high, default, low"
            ))),
        }
    }
}

/// 投递约定
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOptions {
    pub max_retry: u32,
    pub timeout: Duration,
    pub tier: Option<QueueTier>,
    pub priority: Option<i32>,
    /// 只投递给该Worker，`None` 表示任意Worker
    pub target_worker: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_retry: 3,
            timeout: Duration::from_secs(300),
            tier: None,
            priority: None,
            target_worker: None,
        }
    }
}

impl EnqueueOptions {
    pub fn new(max_retry: u32, timeout: Duration) -> Self {
        Self {
            max_retry,
            timeout,
            ..Default::default()
        }
    }

    pub fn with_tier(mut self, tier: QueueTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_target_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.target_worker = Some(worker_id.into());
        self
    }

    /// 显式层级优先，否则由数值优先级推导，两者都没有时为Default
    pub fn resolve_tier(&self) -> QueueTier {
        self.tier
            .or_else(|| self.priority.map(QueueTier::from_priority))
            .unwrap_or(QueueTier::Default)
    }
}

/// 队列持久化记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEnvelope {
    pub task: Task,
    pub tier: QueueTier,
    pub max_retry: u32,
    pub timeout_ms: u64,
    /// 已经失败的投递次数
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// 重试退避：在此时间之前不会被再次投递
    pub not_before: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// 定向投递的Worker
    #[serde(default)]
    pub target_worker: Option<String>,
}

impl TaskEnvelope {
    pub fn new(task: Task, options: &EnqueueOptions) -> Self {
        Self {
            task,
            tier: options.resolve_tier(),
            max_retry: options.max_retry,
            timeout_ms: options.timeout.as_millis() as u64,
            attempts: 0,
            enqueued_at: Utc::now(),
            not_before: None,
            last_error: None,
            target_worker: options.target_worker.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `worker_id` 是否可以领取该任务
    pub fn is_deliverable_to(&self, worker_id: Option<&str>) -> bool {
        match &self.target_worker {
            None => true,
            Some(target) => worker_id == Some(target.as_str()),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map(|t| t <= now).unwrap_or(true)
    }

    /// 记录一次失败投递，返回是否还能继续重试
    pub fn record_failure(&mut self, error: impl Into<String>) -> bool {
        self.attempts += 1;
        self.last_error = Some(error.into());
        !self.is_retry_exhausted()
    }

    pub fn is_retry_exhausted(&self) -> bool {
        self.attempts > self.max_retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_to_tier_thresholds() {
        assert_eq!(QueueTier::from_priority(100), QueueTier::Critical);
        assert_eq!(QueueTier::from_priority(90), QueueTier::Critical);
        assert_eq!(QueueTier::from_priority(89), QueueTier::High);
        assert_eq!(QueueTier::from_priority(60), QueueTier::High);
        assert_eq!(QueueTier::from_priority(59), QueueTier::Default);
        assert_eq!(QueueTier::from_priority(20), QueueTier::Default);
        assert_eq!(QueueTier::from_priority(19), QueueTier::Low);
        assert_eq!(QueueTier::from_priority(-5), QueueTier::Low);
    }

    #[test]
    fn test_resolve_tier() {
        assert_eq!(EnqueueOptions::default().resolve_tier(), QueueTier::Default);
        assert_eq!(
            EnqueueOptions::default().with_priority(95).resolve_tier(),
            QueueTier::Critical
        );
        // 显式层级优先于数值优先级
        assert_eq!(
            EnqueueOptions::default()
                .with_priority(95)
                .with_tier(QueueTier::Low)
                .resolve_tier(),
            QueueTier::Low
        );
    }

    #[test]
    fn test_tier_order_and_parse() {
        assert!(QueueTier::Critical > QueueTier::High);
        assert!(QueueTier::Default > QueueTier::Low);
        assert_eq!("HIGH".parse::<QueueTier>().unwrap(), QueueTier::High);
        assert!("urgent".parse::<QueueTier>().is_err());
    }

    #[test]
    fn test_envelope_retry_accounting() {
        let task = Task::new("t-1", "sandbox-create", serde_json::json!({}));
        let mut envelope = TaskEnvelope::new(task, &EnqueueOptions::new(2, Duration::from_secs(1)));

        assert!(envelope.record_failure("first"));
        assert!(envelope.record_failure("second"));
        // 第三次失败即为 max_retry + 1 次投递
        assert!(!envelope.record_failure("third"));
        assert_eq!(envelope.attempts, 3);
        assert_eq!(envelope.last_error.as_deref(), Some("third"));
    }

    #[test]
    fn test_target_worker_limits_delivery() {
        let task = Task::new("t-1", "sandbox-delete", serde_json::json!({}));
        let open = TaskEnvelope::new(task.clone(), &EnqueueOptions::default());
        assert!(open.is_deliverable_to(None));
        assert!(open.is_deliverable_to(Some("worker-2")));

        let targeted = TaskEnvelope::new(
            task,
            &EnqueueOptions::default().with_target_worker("worker-1"),
        );
        assert_eq!(targeted.target_worker.as_deref(), Some("worker-1"));
        assert!(targeted.is_deliverable_to(Some("worker-1")));
        assert!(!targeted.is_deliverable_to(Some("worker-2")));
        assert!(!targeted.is_deliverable_to(None));

        // 旧记录没有该字段时视为公共任务
        let mut raw = serde_json::to_value(&open).unwrap();
        raw.as_object_mut().unwrap().remove("target_worker");
        let decoded: TaskEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(decoded.target_worker, None);
    }

    #[test]
    fn test_parse_payload() {
        #[derive(Deserialize)]
        struct Payload {
            sandbox_id: String,
        }
        let task = Task::new("t", "x", serde_json::json!({"sandbox_id": "sb-1"}));
        let payload: Payload = task.parse_payload().unwrap();
        assert_eq!(payload.sandbox_id, "sb-1");

        let bad = Task::new("t", "x", serde_json::json!({"other": 1}));
        assert!(bad.parse_payload::<Payload>().is_err());
    }
}
