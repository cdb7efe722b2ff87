//! Worker注册表
//!
//! 注册表维护集群中所有Worker的成员关系与资源快照。表本身用读写锁保护，
//! 每个Worker记录有独立的互斥锁：对单个Worker的修改只持有该Worker的锁，
//! 表的写锁只在插入和删除时短暂持有。
//!
//! 离线判定是惰性的：读取时若心跳超过注销阈值则报告为 `Offline`，
//! 真正的删除由清理循环（见 [`crate::expiry_sweeper`]）完成。
//!
//! 每次修改都会写入可插拔的 [`RegistryStore`]（键为 `workers/<id>`，
//! TTL为注销阈值），存储失败只记录日志，不影响本地操作。
//! 记录在互斥区内修改并发出事件，写存储在释放记录锁之后进行；
//! 每条记录带修改序号，较旧的快照不会覆盖已写入的较新快照。

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vmfleet_core::config::RegistryConfig;
use vmfleet_core::models::{
    ResourceRequest, ResourceUsage, Worker, WorkerEvent, WorkerFilter, WorkerRegistration,
    WorkerResources, WorkerStatus,
};
use vmfleet_core::traits::{RegistryStore, StoreChange};
use vmfleet_errors::{FleetError, FleetResult};

/// 存储中Worker记录的键前缀
pub const WORKER_KEY_PREFIX: &str = "workers/";

fn worker_key(id: &str) -> String {
    format!("{WORKER_KEY_PREFIX}{id}")
}

/// Worker变更订阅
///
/// 每个订阅者拥有独立的无界通道，慢订阅者不会影响其他订阅者。
/// 丢弃订阅后，注册表会在下一次发送事件时将其移除。
pub struct WorkerWatcher {
    receiver: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl WorkerWatcher {
    pub async fn recv(&mut self) -> Option<WorkerEvent> {
        self.receiver.recv().await
    }

    /// 非阻塞地取出一个已到达的事件
    pub fn try_recv(&mut self) -> Option<WorkerEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for WorkerWatcher {
    type Item = WorkerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// 单条记录的存储写入状态
///
/// 同一时刻最多一个调用方负责写存储，其他调用方只留下最新快照后立即返回。
#[derive(Default)]
struct StoreSync {
    /// 等待写入的最新快照
    pending: Option<Worker>,
    writing: bool,
    /// 已写入存储的最大修改序号
    persisted: Option<u64>,
    /// 记录已从注册表删除
    retired: bool,
}

struct WorkerEntry {
    record: Mutex<Worker>,
    sync: Mutex<StoreSync>,
}

impl WorkerEntry {
    fn new(worker: Worker) -> Arc<Self> {
        Arc::new(Self {
            record: Mutex::new(worker),
            sync: Mutex::new(StoreSync::default()),
        })
    }

    /// 存储中已有该修改序号的快照，丢弃不比它新的待写快照
    async fn mark_persisted(&self, revision: u64) {
        let mut sync = self.sync.lock().await;
        sync.persisted = Some(revision);
        if sync.pending.as_ref().is_some_and(|p| p.revision <= revision) {
            sync.pending = None;
        }
    }
}

pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Arc<WorkerEntry>>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<WorkerEvent>>>,
    store: Option<Arc<dyn RegistryStore>>,
    threshold: Duration,
}

impl WorkerRegistry {
    /// 创建只在本地内存中维护的注册表
    pub fn new(deregister_threshold: Duration) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            store: None,
            threshold: deregister_threshold,
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(config.deregister_threshold())
    }

    /// 挂接持久化存储，所有修改写穿到存储
    pub fn with_store(mut self, store: Arc<dyn RegistryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn deregister_threshold(&self) -> Duration {
        self.threshold
    }

    fn chrono_threshold(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.threshold.as_millis() as i64)
    }

    /// 注册Worker，ID已存在时返回 `AlreadyExists`
    pub async fn register(&self, registration: WorkerRegistration) -> FleetResult<Worker> {
        let worker = Worker::new(registration);
        let id = worker.id.clone();
        let entry = WorkerEntry::new(worker.clone());

        {
            // 先持有记录锁，保证 Joined 先于该Worker的任何 Updated 发出
            let _record = entry.record.lock().await;
            {
                let mut workers = self.workers.write().await;
                if workers.contains_key(&id) {
                    return Err(FleetError::AlreadyExists { kind: "Worker", id });
                }
                workers.insert(id.clone(), entry.clone());
                metrics::gauge!("vmfleet_workers").set(workers.len() as f64);
            }
            self.emit(WorkerEvent::Joined(worker.clone())).await;
        }

        self.persist(&entry, &worker).await;
        info!(
            worker_id = %id,
            zone = %worker.zone,
            cpu_cores = worker.resources.capacity.cpu_cores,
            memory_mb = worker.resources.capacity.memory_mb,
            "Worker已注册"
        );
        Ok(worker)
    }

    /// 注销Worker，幂等：未知ID返回 `Ok(false)`
    pub async fn deregister(&self, id: &str) -> FleetResult<bool> {
        let removed = {
            let mut workers = self.workers.write().await;
            let removed = workers.remove(id);
            metrics::gauge!("vmfleet_workers").set(workers.len() as f64);
            removed
        };

        let Some(entry) = removed else {
            debug!(worker_id = %id, "注销未知Worker，忽略");
            return Ok(false);
        };
        self.retire(&entry, id).await;

        if let Some(store) = &self.store {
            if let Err(e) = store.delete(&worker_key(id)).await {
                warn!(worker_id = %id, error = %e, "从注册存储删除Worker失败");
            }
        }

        info!(worker_id = %id, "Worker已注销");
        Ok(true)
    }

    /// 刷新心跳时间，惰性离线的Worker会因此恢复
    pub async fn heartbeat(&self, id: &str) -> FleetResult<()> {
        let entry = self.entry(id).await?;
        let snapshot = {
            let mut worker = entry.record.lock().await;
            let now = Utc::now();

            let was_expired = worker.is_heartbeat_expired(self.chrono_threshold(), now);
            worker.last_seen = now;
            if worker.status == WorkerStatus::Offline {
                worker.status = WorkerStatus::Active;
            }
            worker.revision += 1;

            if was_expired {
                info!(worker_id = %id, "Worker心跳恢复");
                self.emit(WorkerEvent::Updated(worker.clone())).await;
            }
            worker.clone()
        };

        self.persist(&entry, &snapshot).await;
        Ok(())
    }

    pub async fn update_status(&self, id: &str, status: WorkerStatus) -> FleetResult<Worker> {
        self.mutate(id, |worker| {
            worker.status = status;
            Ok(())
        })
        .await
    }

    /// 覆盖资源快照，违反 `used <= capacity` 时返回 `InvalidResources`
    pub async fn update_resources(
        &self,
        id: &str,
        resources: WorkerResources,
    ) -> FleetResult<Worker> {
        if !resources.is_consistent() {
            return Err(FleetError::InvalidResources(format!(
                "Worker {id} 的使用量超过容量: {resources:?}"
            )));
        }
        self.mutate(id, |worker| {
            worker.resources = resources;
            Ok(())
        })
        .await
    }

    /// 在Worker的互斥区内重新检查容量并占用资源
    pub async fn allocate(&self, id: &str, request: &ResourceRequest) -> FleetResult<Worker> {
        let threshold = self.chrono_threshold();
        let worker = self
            .mutate(id, |worker| {
                let status = worker.effective_status(threshold, Utc::now());
                if status != WorkerStatus::Active {
                    return Err(FleetError::InvalidState(format!(
                        "Worker {} 当前状态为 {}，不接受新的沙箱",
                        worker.id,
                        status.as_str()
                    )));
                }
                if !worker.resources.can_allocate_request(request) {
                    return Err(FleetError::CapacityExceeded(format!(
                        "Worker {} 可用 cpu={} memory={}MB sandboxes={}，请求 cpu={} memory={}MB",
                        worker.id,
                        worker.resources.available_cpu(),
                        worker.resources.available_memory_mb(),
                        worker.resources.available_sandboxes(),
                        request.cpu_cores,
                        request.memory_mb
                    )));
                }
                worker.resources.allocate(request);
                Ok(())
            })
            .await;

        match &worker {
            Ok(_) => metrics::counter!("vmfleet_worker_allocations_total").increment(1),
            Err(FleetError::CapacityExceeded(_)) => {
                metrics::counter!("vmfleet_worker_allocation_rejections_total").increment(1)
            }
            Err(_) => {}
        }
        worker
    }

    /// 释放资源，计数不会低于0
    pub async fn release(&self, id: &str, request: &ResourceRequest) -> FleetResult<Worker> {
        self.mutate(id, |worker| {
            worker.resources.release(request);
            Ok(())
        })
        .await
    }

    /// 用本地实际存活的沙箱重新计算的使用量覆盖计数
    pub async fn reset_usage(&self, id: &str, usage: ResourceUsage) -> FleetResult<Worker> {
        self.mutate(id, |worker| {
            let candidate = WorkerResources {
                capacity: worker.resources.capacity,
                usage,
            };
            if !candidate.is_consistent() {
                return Err(FleetError::InvalidResources(format!(
                    "Worker {} 的实际使用量超过容量: {usage:?}",
                    worker.id
                )));
            }
            worker.resources = candidate;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Option<Worker> {
        let entry = self.entry(id).await.ok()?;
        let worker = entry.record.lock().await;
        Some(worker.with_lazy_expiry(self.chrono_threshold(), Utc::now()))
    }

    pub async fn list_workers(&self) -> Vec<Worker> {
        self.list_workers_with_filter(&WorkerFilter::default()).await
    }

    /// 按条件列出Worker
    ///
    /// 先在读锁下复制记录引用，再逐个加锁读取，不会持有整张表的锁等待单个Worker。
    pub async fn list_workers_with_filter(&self, filter: &WorkerFilter) -> Vec<Worker> {
        let entries: Vec<Arc<WorkerEntry>> =
            self.workers.read().await.values().cloned().collect();
        let threshold = self.chrono_threshold();
        let now = Utc::now();

        let mut result = Vec::with_capacity(entries.len());
        for entry in entries {
            let worker = entry.record.lock().await.with_lazy_expiry(threshold, now);
            if filter.matches(&worker) {
                result.push(worker);
            }
        }
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }

    /// 订阅Worker变更
    pub async fn watch(&self) -> WorkerWatcher {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.watchers.lock().await.push(sender);
        WorkerWatcher { receiver }
    }

    /// 删除所有心跳超过阈值的Worker，返回被删除的ID
    pub async fn sweep_expired(&self) -> FleetResult<Vec<String>> {
        let entries: Vec<(String, Arc<WorkerEntry>)> = self
            .workers
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        let threshold = self.chrono_threshold();

        let mut expired = Vec::new();
        for (id, entry) in entries {
            if entry.record.lock().await.is_heartbeat_expired(threshold, Utc::now()) {
                expired.push(id);
            }
        }

        let mut removed = Vec::new();
        for id in expired {
            // 期间可能收到心跳，删除前再确认一次
            let still_expired = match self.entry(&id).await {
                Ok(entry) => entry
                    .record
                    .lock()
                    .await
                    .is_heartbeat_expired(threshold, Utc::now()),
                Err(_) => false,
            };
            if still_expired && self.deregister(&id).await? {
                warn!(worker_id = %id, "Worker心跳超时，已从注册表移除");
                removed.push(id);
            }
        }

        if !removed.is_empty() {
            metrics::counter!("vmfleet_workers_expired_total").increment(removed.len() as u64);
        }
        Ok(removed)
    }

    /// 从存储合并其他进程写入的Worker记录，返回新增或更新的数量
    pub async fn sync_from_store(&self) -> FleetResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let records = store.list(WORKER_KEY_PREFIX).await?;
        let mut merged = 0;
        for (key, value) in records {
            match serde_json::from_str::<Worker>(&value) {
                Ok(worker) => {
                    if self.apply_remote(worker).await {
                        merged += 1;
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "忽略无法解析的Worker记录"),
            }
        }

        if merged > 0 {
            debug!(merged, "从注册存储合并Worker记录");
        }
        Ok(merged)
    }

    /// 持续跟随存储的变更通知，直到取消
    pub async fn follow_store(&self, cancel: CancellationToken) -> FleetResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut changes = store.watch().await?;
        self.sync_from_store().await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(StoreChange::Put { key, value }) => {
                        if key.starts_with(WORKER_KEY_PREFIX) {
                            match serde_json::from_str::<Worker>(&value) {
                                Ok(worker) => {
                                    self.apply_remote(worker).await;
                                }
                                Err(e) => warn!(key = %key, error = %e, "忽略无法解析的Worker记录"),
                            }
                        }
                    }
                    Ok(StoreChange::Deleted { key }) => {
                        if let Some(id) = key.strip_prefix(WORKER_KEY_PREFIX) {
                            self.remove_local(id).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "注册存储变更通知落后，重新全量同步");
                        if let Err(e) = self.sync_from_store().await {
                            warn!(error = %e, "重新同步注册存储失败");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("注册存储变更通道已关闭");
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    /// 合并一条远端记录，只接受比本地更新的快照
    ///
    /// 存储会回放本进程自己写入的记录，这些回放不会比本地记录更新，因此被忽略。
    async fn apply_remote(&self, remote: Worker) -> bool {
        let existing = self.workers.read().await.get(&remote.id).cloned();
        match existing {
            Some(entry) => {
                {
                    let mut local = entry.record.lock().await;
                    if !remote.is_newer_than(&local) {
                        return false;
                    }
                    *local = remote.clone();
                    self.emit(WorkerEvent::Updated(remote.clone())).await;
                }
                // 存储中已经是这份快照
                entry.mark_persisted(remote.revision).await;
                true
            }
            None => {
                let revision = remote.revision;
                let entry = WorkerEntry::new(remote.clone());
                {
                    let _record = entry.record.lock().await;
                    {
                        let mut workers = self.workers.write().await;
                        if workers.contains_key(&remote.id) {
                            return false;
                        }
                        workers.insert(remote.id.clone(), entry.clone());
                        metrics::gauge!("vmfleet_workers").set(workers.len() as f64);
                    }
                    info!(worker_id = %remote.id, "发现远端Worker");
                    self.emit(WorkerEvent::Joined(remote)).await;
                }
                entry.mark_persisted(revision).await;
                true
            }
        }
    }

    /// 只删除本地记录，不回写存储
    async fn remove_local(&self, id: &str) {
        let removed = self.workers.write().await.remove(id);
        if let Some(entry) = removed {
            info!(worker_id = %id, "远端Worker已离开");
            self.retire(&entry, id).await;
        }
    }

    /// 发出 `Left` 并阻止尚未完成的写入复活已删除的记录
    async fn retire(&self, entry: &WorkerEntry, id: &str) {
        {
            let _record = entry.record.lock().await;
            self.emit(WorkerEvent::Left {
                worker_id: id.to_string(),
            })
            .await;
        }
        let mut sync = entry.sync.lock().await;
        sync.retired = true;
        sync.pending = None;
    }

    async fn entry(&self, id: &str) -> FleetResult<Arc<WorkerEntry>> {
        self.workers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::worker_not_found(id))
    }

    /// 在单个Worker的互斥区内修改记录并发出 `Updated`，释放记录锁后写穿存储
    async fn mutate<F>(&self, id: &str, f: F) -> FleetResult<Worker>
    where
        F: FnOnce(&mut Worker) -> FleetResult<()>,
    {
        let entry = self.entry(id).await?;
        let snapshot = {
            let mut worker = entry.record.lock().await;
            f(&mut worker)?;
            worker.revision += 1;
            self.emit(WorkerEvent::Updated(worker.clone())).await;
            worker.clone()
        };
        self.persist(&entry, &snapshot).await;
        Ok(snapshot)
    }

    /// 写入快照
    ///
    /// 已有调用方在写存储时只登记快照并返回，由正在写的调用方接着写入最新的一份。
    /// 修改序号不大于已写入或已登记快照的快照直接丢弃。
    async fn persist(&self, entry: &WorkerEntry, worker: &Worker) {
        let Some(store) = &self.store else {
            return;
        };
        {
            let mut sync = entry.sync.lock().await;
            let superseded = sync.persisted.is_some_and(|r| r >= worker.revision)
                || sync
                    .pending
                    .as_ref()
                    .is_some_and(|p| p.revision >= worker.revision);
            if sync.retired || superseded {
                debug!(worker_id = %worker.id, revision = worker.revision, "跳过过期的快照");
                return;
            }
            sync.pending = Some(worker.clone());
            if sync.writing {
                return;
            }
            sync.writing = true;
        }

        loop {
            let next = {
                let mut sync = entry.sync.lock().await;
                match sync.pending.take() {
                    Some(next) => next,
                    None => {
                        sync.writing = false;
                        return;
                    }
                }
            };

            let key = worker_key(&next.id);
            let written = match serde_json::to_string(&next) {
                Ok(value) => match store.put(&key, &value, Some(self.threshold)).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(worker_id = %next.id, error = %e, "写入注册存储失败");
                        false
                    }
                },
                Err(e) => {
                    warn!(worker_id = %next.id, error = %e, "序列化Worker记录失败");
                    false
                }
            };

            let retired = {
                let mut sync = entry.sync.lock().await;
                if written {
                    sync.persisted = sync.persisted.max(Some(next.revision));
                }
                sync.retired
            };
            // 写入期间记录被注销，撤销这次写入
            if written && retired {
                if let Err(e) = store.delete(&key).await {
                    warn!(worker_id = %next.id, error = %e, "撤销已注销Worker的记录失败");
                }
            }
        }
    }

    async fn emit(&self, event: WorkerEvent) {
        let mut watchers = self.watchers.lock().await;
        watchers.retain(|sender| sender.send(event.clone()).is_ok());
    }
}
