use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vmfleet_core::config::RedisConfig;
use vmfleet_core::models::{QueueTier, TaskEnvelope};
use vmfleet_core::traits::{Lease, LeasedTask, QueueStore, QueueStoreStats};
use vmfleet_errors::{FleetError, FleetResult};

use super::scripts;
use crate::redis_support::{self, redis_error, KeySpace};

/// Redis队列存储
///
/// 键布局（均带前缀）：
/// - `queue:tasks` 哈希，任务ID -> 任务记录
/// - `queue:pending:{tier}` 列表，按层级排队的公共任务ID
/// - `queue:pending:{tier}:worker:{id}` 列表，定向给某个Worker的任务ID
/// - `queue:delayed` 有序集合，退避中的任务，分数为可投递时间
/// - `queue:leases` 有序集合，租约中的任务，分数为租约截止时间
/// - `queue:lease_ids` 哈希，任务ID -> 当前租约ID
/// - `queue:failed` 哈希，终止失败的任务
pub struct RedisQueueStore {
    conn: ConnectionManager,
    keys: KeySpace,
    push_script: Script,
    pop_script: Script,
    ack_script: Script,
    retry_script: Script,
    fail_script: Script,
}

impl RedisQueueStore {
    pub async fn new(config: &RedisConfig) -> FleetResult<Self> {
        let (_, conn) = redis_support::connect(config).await?;
        info!("Redis队列存储已连接，前缀: {}", config.key_prefix);
        Ok(Self::with_connection(conn, KeySpace::new(config.key_prefix.clone())))
    }

    pub fn with_connection(conn: ConnectionManager, keys: KeySpace) -> Self {
        Self {
            conn,
            keys,
            push_script: Script::new(scripts::PUSH),
            pop_script: Script::new(scripts::POP_LEASE),
            ack_script: Script::new(scripts::ACK),
            retry_script: Script::new(scripts::RETRY),
            fail_script: Script::new(scripts::FAIL),
        }
    }

    fn tasks_key(&self) -> String {
        self.keys.key("queue:tasks")
    }

    fn pending_prefix(&self) -> String {
        self.keys.key("queue:pending:")
    }

    fn pending_key(&self, tier: QueueTier, target: Option<&str>) -> String {
        match target {
            Some(worker_id) => format!("{}{}:worker:{worker_id}", self.pending_prefix(), tier.as_str()),
            None => format!("{}{}", self.pending_prefix(), tier.as_str()),
        }
    }

    fn envelope_pending_key(&self, envelope: &TaskEnvelope) -> String {
        self.pending_key(envelope.tier, envelope.target_worker.as_deref())
    }

    fn delayed_key(&self) -> String {
        self.keys.key("queue:delayed")
    }

    fn leases_key(&self) -> String {
        self.keys.key("queue:leases")
    }

    fn lease_ids_key(&self) -> String {
        self.keys.key("queue:lease_ids")
    }

    fn failed_key(&self) -> String {
        self.keys.key("queue:failed")
    }

    fn not_before_ms(envelope: &TaskEnvelope) -> String {
        envelope
            .not_before
            .map(|t| t.timestamp_millis().to_string())
            .unwrap_or_default()
    }

    fn decode(raw: &str) -> FleetResult<TaskEnvelope> {
        serde_json::from_str(raw)
            .map_err(|e| FleetError::Serialization(format!("解析队列记录失败: {e}")))
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn push(&self, envelope: &TaskEnvelope) -> FleetResult<bool> {
        let body = serde_json::to_string(envelope)?;
        let mut conn = self.conn.clone();
        let inserted: i64 = self
            .push_script
            .key(self.tasks_key())
            .key(self.delayed_key())
            .key(self.failed_key())
            .key(self.envelope_pending_key(envelope))
            .arg(envelope.id())
            .arg(body)
            .arg(Self::not_before_ms(envelope))
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;

        if inserted == 0 {
            debug!("任务 {} 已在队列中，忽略重复入队", envelope.id());
        }
        Ok(inserted == 1)
    }

    async fn pop_lease(
        &self,
        worker_id: Option<&str>,
        lease_duration: Duration,
    ) -> FleetResult<Option<LeasedTask>> {
        let now = Utc::now();
        let lease_duration = chrono::Duration::from_std(lease_duration)
            .map_err(|e| FleetError::Internal(format!("无效的租约时长: {e}")))?;
        let deadline = now + lease_duration;
        let lease_id = Uuid::new_v4().to_string();

        let mut invocation = self.pop_script.key(self.tasks_key());
        invocation
            .key(self.delayed_key())
            .key(self.leases_key())
            .key(self.lease_ids_key());
        for tier in QueueTier::ALL {
            invocation.key(self.pending_key(tier, None));
        }
        if let Some(worker_id) = worker_id {
            for tier in QueueTier::ALL {
                invocation.key(self.pending_key(tier, Some(worker_id)));
            }
        }
        invocation
            .arg(now.timestamp_millis())
            .arg(deadline.timestamp_millis())
            .arg(&lease_id)
            .arg(self.pending_prefix());

        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;

        let Some((task_id, raw)) = popped else {
            return Ok(None);
        };
        let envelope = Self::decode(&raw)?;
        Ok(Some(LeasedTask {
            envelope,
            lease: Lease {
                task_id,
                lease_id,
                deadline,
            },
        }))
    }

    async fn ack(&self, lease: &Lease) -> FleetResult<bool> {
        let mut conn = self.conn.clone();
        let acked: i64 = self
            .ack_script
            .key(self.tasks_key())
            .key(self.leases_key())
            .key(self.lease_ids_key())
            .arg(&lease.task_id)
            .arg(&lease.lease_id)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(acked == 1)
    }

    async fn retry(&self, lease: &Lease, envelope: &TaskEnvelope) -> FleetResult<bool> {
        let body = serde_json::to_string(envelope)?;
        let mut conn = self.conn.clone();
        let retried: i64 = self
            .retry_script
            .key(self.tasks_key())
            .key(self.leases_key())
            .key(self.lease_ids_key())
            .key(self.delayed_key())
            .key(self.envelope_pending_key(envelope))
            .arg(&lease.task_id)
            .arg(&lease.lease_id)
            .arg(body)
            .arg(Self::not_before_ms(envelope))
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(retried == 1)
    }

    async fn fail(&self, lease: &Lease, envelope: &TaskEnvelope) -> FleetResult<bool> {
        let body = serde_json::to_string(envelope)?;
        let mut conn = self.conn.clone();
        let failed: i64 = self
            .fail_script
            .key(self.tasks_key())
            .key(self.leases_key())
            .key(self.lease_ids_key())
            .key(self.failed_key())
            .arg(&lease.task_id)
            .arg(&lease.lease_id)
            .arg(body)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(failed == 1)
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> FleetResult<Vec<LeasedTask>> {
        let mut conn = self.conn.clone();
        let expired: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.leases_key())
            .arg("-inf")
            .arg(format!("({}", now.timestamp_millis()))
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        let mut leased = Vec::with_capacity(expired.len());
        for (task_id, deadline_ms) in expired {
            let (raw, lease_id): (Option<String>, Option<String>) = redis::pipe()
                .hget(self.tasks_key(), &task_id)
                .hget(self.lease_ids_key(), &task_id)
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;

            let (Some(raw), Some(lease_id)) = (raw, lease_id) else {
                continue;
            };
            let deadline = match Utc.timestamp_millis_opt(deadline_ms as i64).single() {
                Some(deadline) => deadline,
                None => {
                    warn!("任务 {} 的租约截止时间无效: {}", task_id, deadline_ms);
                    continue;
                }
            };

            leased.push(LeasedTask {
                envelope: Self::decode(&raw)?,
                lease: Lease {
                    task_id,
                    lease_id,
                    deadline,
                },
            });
        }
        Ok(leased)
    }

    async fn failed(&self) -> FleetResult<Vec<TaskEnvelope>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("HVALS")
            .arg(self.failed_key())
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        let mut failed = raw
            .iter()
            .map(|r| Self::decode(r))
            .collect::<FleetResult<Vec<_>>>()?;
        failed.sort_by_key(|e| e.enqueued_at);
        Ok(failed)
    }

    async fn purge_failed(&self) -> FleetResult<usize> {
        let mut conn = self.conn.clone();
        let (count, _): (usize, i64) = redis::pipe()
            .atomic()
            .hlen(self.failed_key())
            .del(self.failed_key())
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(count)
    }

    async fn stats(&self) -> FleetResult<QueueStoreStats> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for tier in QueueTier::ALL {
            pipe.llen(self.pending_key(tier, None));
        }
        pipe.zcard(self.delayed_key())
            .zcard(self.leases_key())
            .hlen(self.failed_key())
            .hlen(self.tasks_key());

        let counts: Vec<usize> = pipe.query_async(&mut conn).await.map_err(redis_error)?;
        if counts.len() != QueueTier::ALL.len() + 4 {
            return Err(FleetError::storage_error("队列统计结果数量不匹配"));
        }

        let mut stats = QueueStoreStats::default();
        let mut shared = 0;
        for (tier, count) in QueueTier::ALL.iter().zip(&counts) {
            if *count > 0 {
                stats.pending.insert(*tier, *count);
                shared += *count;
            }
        }
        let tail = &counts[QueueTier::ALL.len()..];
        stats.delayed = tail[0];
        stats.leased = tail[1];
        stats.failed = tail[2];
        // 私有分区分散在各Worker的键下，用任务总数扣除其余部分
        stats.targeted = tail[3].saturating_sub(shared + stats.delayed + stats.leased);
        Ok(stats)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
