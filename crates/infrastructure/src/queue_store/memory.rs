use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;
use vmfleet_core::models::{QueueTier, TaskEnvelope};
use vmfleet_core::traits::{Lease, LeasedTask, QueueStore, QueueStoreStats};
use vmfleet_errors::{FleetError, FleetResult};

/// 任务分区：层级加可选的目标Worker
type Partition = (QueueTier, Option<String>);

#[derive(Default)]
struct QueueState {
    /// 每个分区的任务ID，按入队顺序排列；退避中的任务留在原位，弹出时跳过
    pending: BTreeMap<Partition, VecDeque<String>>,
    /// 排队中和租约中的任务
    tasks: HashMap<String, TaskEnvelope>,
    leases: HashMap<String, Lease>,
    failed: Vec<TaskEnvelope>,
}

impl QueueState {
    fn enqueue(&mut self, envelope: TaskEnvelope) {
        let id = envelope.id().to_string();
        self.pending
            .entry((envelope.tier, envelope.target_worker.clone()))
            .or_default()
            .push_back(id.clone());
        self.tasks.insert(id, envelope);
    }

    fn take_lease(&mut self, lease: &Lease) -> bool {
        match self.leases.get(&lease.task_id) {
            Some(current) if current.lease_id == lease.lease_id => {
                self.leases.remove(&lease.task_id);
                true
            }
            _ => false,
        }
    }
}

/// 内存队列存储，只在单进程内有效
pub struct InMemoryQueueStore {
    state: Mutex<QueueState>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
        }
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn push(&self, envelope: &TaskEnvelope) -> FleetResult<bool> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(envelope.id()) {
            debug!("任务 {} 已在队列中，忽略重复入队", envelope.id());
            return Ok(false);
        }
        state.failed.retain(|f| f.id() != envelope.id());
        state.enqueue(envelope.clone());
        Ok(true)
    }

    async fn pop_lease(
        &self,
        worker_id: Option<&str>,
        lease_duration: Duration,
    ) -> FleetResult<Option<LeasedTask>> {
        let now = Utc::now();
        let lease_duration = chrono::Duration::from_std(lease_duration)
            .map_err(|e| FleetError::Internal(format!("无效的租约时长: {e}")))?;

        let mut state = self.state.lock().await;
        let QueueState {
            pending, tasks, leases, ..
        } = &mut *state;

        let mut partitions = Vec::with_capacity(QueueTier::ALL.len() * 2);
        for tier in QueueTier::ALL {
            if let Some(worker_id) = worker_id {
                partitions.push((tier, Some(worker_id.to_string())));
            }
            partitions.push((tier, None));
        }

        for partition in partitions {
            let Some(ids) = pending.get_mut(&partition) else {
                continue;
            };
            ids.retain(|id| tasks.contains_key(id));
            let position = ids
                .iter()
                .position(|id| tasks.get(id).map(|t| t.is_due(now)).unwrap_or(false));
            let Some(position) = position else {
                continue;
            };
            let Some(id) = ids.remove(position) else {
                continue;
            };
            let Some(envelope) = tasks.get(&id).cloned() else {
                continue;
            };

            let lease = Lease {
                task_id: id.clone(),
                lease_id: Uuid::new_v4().to_string(),
                deadline: now + lease_duration,
            };
            leases.insert(id, lease.clone());
            return Ok(Some(LeasedTask { envelope, lease }));
        }

        Ok(None)
    }

    async fn ack(&self, lease: &Lease) -> FleetResult<bool> {
        let mut state = self.state.lock().await;
        if !state.take_lease(lease) {
            return Ok(false);
        }
        state.tasks.remove(&lease.task_id);
        Ok(true)
    }

    async fn retry(&self, lease: &Lease, envelope: &TaskEnvelope) -> FleetResult<bool> {
        let mut state = self.state.lock().await;
        if !state.take_lease(lease) {
            return Ok(false);
        }
        state.enqueue(envelope.clone());
        Ok(true)
    }

    async fn fail(&self, lease: &Lease, envelope: &TaskEnvelope) -> FleetResult<bool> {
        let mut state = self.state.lock().await;
        if !state.take_lease(lease) {
            return Ok(false);
        }
        state.tasks.remove(&lease.task_id);
        state.failed.push(envelope.clone());
        Ok(true)
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> FleetResult<Vec<LeasedTask>> {
        let state = self.state.lock().await;
        Ok(state
            .leases
            .values()
            .filter(|lease| lease.deadline < now)
            .filter_map(|lease| {
                state.tasks.get(&lease.task_id).map(|envelope| LeasedTask {
                    envelope: envelope.clone(),
                    lease: lease.clone(),
                })
            })
            .collect())
    }

    async fn failed(&self) -> FleetResult<Vec<TaskEnvelope>> {
        Ok(self.state.lock().await.failed.clone())
    }

    async fn purge_failed(&self) -> FleetResult<usize> {
        let mut state = self.state.lock().await;
        let count = state.failed.len();
        state.failed.clear();
        Ok(count)
    }

    async fn stats(&self) -> FleetResult<QueueStoreStats> {
        let now = Utc::now();
        let state = self.state.lock().await;
        let mut stats = QueueStoreStats {
            leased: state.leases.len(),
            failed: state.failed.len(),
            ..Default::default()
        };

        for ((tier, target), ids) in &state.pending {
            for id in ids {
                match state.tasks.get(id) {
                    Some(envelope) if envelope.is_due(now) && target.is_some() => {
                        stats.targeted += 1;
                    }
                    Some(envelope) if envelope.is_due(now) => {
                        *stats.pending.entry(*tier).or_default() += 1;
                    }
                    Some(_) => stats.delayed += 1,
                    None => {}
                }
            }
        }

        Ok(stats)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
