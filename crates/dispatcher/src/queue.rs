//! 任务分发队列
//!
//! 提交方通过 [`TaskQueue::enqueue`] 持久化任务，调用立即返回，不等待处理器执行。
//! 启动后队列运行 `concurrency` 个消费循环和一个租约回收循环：
//!
//! - 消费循环按层级顺序带租约弹出任务，每次投递在独立的tokio任务中执行，
//!   并受任务超时限制；
//! - 处理器成功则确认并删除记录，失败、panic、超时或没有处理器则计一次失败，
//!   未超过 `max_retry` 时按退避重新入队，否则移入终止失败集合；
//! - 回收循环处理消费者崩溃后遗留的租约，走同样的重试/失败判定。
//!
//! 同一任务最多投递 `max_retry + 1` 次。
//!
//! 带目标Worker的任务只会被以该Worker身份运行的队列领取。挂接 [`TaskRouter`] 后，
//! 没有目标的任务在入队时由路由器补上目标；领取公共任务时若路由器给出的是另一个
//! Worker，任务原样转入那个Worker的分区，不计入失败次数。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vmfleet_core::config::QueueConfig;
use vmfleet_core::models::{topics, EnqueueOptions, Task, TaskEnvelope};
use vmfleet_core::traits::{
    EventBus, Lease, LeasedTask, QueueStore, QueueStoreStats, TaskContext, TaskHandler,
    TaskRouter,
};
use vmfleet_errors::{FleetError, FleetResult};

use crate::retry::RetryPolicy;

struct QueueInner {
    store: Arc<dyn QueueStore>,
    event_bus: Arc<dyn EventBus>,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    router: RwLock<Option<Arc<dyn TaskRouter>>>,
    /// 以该Worker身份领取任务，`None` 时只领取公共任务
    worker_id: Option<String>,
    config: QueueConfig,
    retry_policy: RetryPolicy,
    wakeup: Notify,
    /// 超时后仍在运行的处理器
    overdue: Mutex<Vec<(String, JoinHandle<FleetResult<serde_json::Value>>)>>,
}

#[derive(Default)]
struct Runtime {
    cancel: Option<CancellationToken>,
    handles: Vec<JoinHandle<()>>,
}

pub struct TaskQueue {
    inner: Arc<QueueInner>,
    runtime: Mutex<Runtime>,
}

impl TaskQueue {
    /// 只领取公共任务的队列
    pub fn new(
        store: Arc<dyn QueueStore>,
        event_bus: Arc<dyn EventBus>,
        config: QueueConfig,
    ) -> Self {
        Self::build(store, event_bus, config, None)
    }

    /// 以 `worker_id` 身份运行的队列，同时领取定向给该Worker的任务
    pub fn for_worker(
        store: Arc<dyn QueueStore>,
        event_bus: Arc<dyn EventBus>,
        config: QueueConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self::build(store, event_bus, config, Some(worker_id.into()))
    }

    fn build(
        store: Arc<dyn QueueStore>,
        event_bus: Arc<dyn EventBus>,
        config: QueueConfig,
        worker_id: Option<String>,
    ) -> Self {
        let retry_policy = RetryPolicy::new(config.retry.clone());
        Self {
            inner: Arc::new(QueueInner {
                store,
                event_bus,
                handlers: RwLock::new(HashMap::new()),
                router: RwLock::new(None),
                worker_id,
                config,
                retry_policy,
                wakeup: Notify::new(),
                overdue: Mutex::new(Vec::new()),
            }),
            runtime: Mutex::new(Runtime::default()),
        }
    }

    pub fn worker_id(&self) -> Option<&str> {
        self.inner.worker_id.as_deref()
    }

    /// 挂接任务路由器，替换已有的路由器
    pub async fn set_router(&self, router: Arc<dyn TaskRouter>) {
        *self.inner.router.write().await = Some(router);
    }

    /// 按配置的默认重试次数和超时生成投递约定
    pub fn default_options(&self) -> EnqueueOptions {
        EnqueueOptions::new(
            self.inner.config.default_max_retry,
            self.inner.config.default_timeout(),
        )
    }

    /// 持久化任务
    ///
    /// 同一ID已在排队或执行中时不重复入队，返回 `Ok(false)`。
    pub async fn enqueue(&self, task: Task, options: EnqueueOptions) -> FleetResult<bool> {
        if task.id.trim().is_empty() {
            return Err(FleetError::EnqueueError("任务ID不能为空".to_string()));
        }
        if task.task_type.trim().is_empty() {
            return Err(FleetError::EnqueueError(format!(
                "任务 {} 的类型不能为空",
                task.id
            )));
        }
        if options.timeout.is_zero() {
            return Err(FleetError::EnqueueError(format!(
                "任务 {} 的超时时间必须大于0",
                task.id
            )));
        }

        let mut options = options;
        if options.target_worker.is_none() {
            options.target_worker = self.inner.route(&task).await;
        }

        let envelope = TaskEnvelope::new(task, &options);
        let pushed = self
            .inner
            .store
            .push(&envelope)
            .await
            .map_err(|e| FleetError::EnqueueError(format!("任务 {}: {e}", envelope.id())))?;

        if pushed {
            debug!(
                task_id = %envelope.id(),
                task_type = %envelope.task.task_type,
                tier = %envelope.tier,
                target_worker = ?envelope.target_worker,
                max_retry = envelope.max_retry,
                "任务已入队"
            );
            metrics::counter!("vmfleet_tasks_enqueued_total", "tier" => envelope.tier.as_str())
                .increment(1);
            self.inner.wakeup.notify_one();
        }
        Ok(pushed)
    }

    /// 为任务类型注册唯一的处理器
    pub async fn register_handler(
        &self,
        task_type: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> FleetResult<()> {
        let mut handlers = self.inner.handlers.write().await;
        if handlers.contains_key(task_type) {
            return Err(FleetError::DuplicateHandler {
                task_type: task_type.to_string(),
            });
        }
        handlers.insert(task_type.to_string(), handler);
        info!(task_type, "注册任务处理器");
        Ok(())
    }

    pub async fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    /// 启动消费循环与租约回收循环，重复启动返回 `InvalidState`
    pub async fn start(&self) -> FleetResult<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.cancel.is_some() {
            return Err(FleetError::InvalidState("任务队列已在运行".to_string()));
        }

        let cancel = CancellationToken::new();
        let concurrency = self.inner.config.concurrency.max(1);
        for consumer in 0..concurrency {
            let inner = self.inner.clone();
            let cancel = cancel.clone();
            runtime
                .handles
                .push(tokio::spawn(async move { inner.consume(consumer, cancel).await }));
        }

        let inner = self.inner.clone();
        let reaper_cancel = cancel.clone();
        runtime
            .handles
            .push(tokio::spawn(async move { inner.reap(reaper_cancel).await }));

        runtime.cancel = Some(cancel);
        info!(
            concurrency,
            backend = self.inner.store.backend_name(),
            "任务队列已启动"
        );
        Ok(())
    }

    /// 停止接收新投递，并等待正在执行的处理器结束
    pub async fn stop(&self) -> FleetResult<()> {
        let (cancel, handles) = {
            let mut runtime = self.runtime.lock().await;
            let Some(cancel) = runtime.cancel.take() else {
                return Ok(());
            };
            (cancel, std::mem::take(&mut runtime.handles))
        };

        info!("正在停止任务队列，等待进行中的任务完成");
        cancel.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("任务队列循环异常退出: {}", e);
            }
        }
        self.inner.drain_overdue().await;
        info!("任务队列已停止");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.cancel.is_some()
    }

    pub async fn stats(&self) -> FleetResult<QueueStoreStats> {
        self.inner.store.stats().await
    }

    pub async fn failed_tasks(&self) -> FleetResult<Vec<TaskEnvelope>> {
        self.inner.store.failed().await
    }

    pub async fn purge_failed(&self) -> FleetResult<usize> {
        self.inner.store.purge_failed().await
    }
}

impl QueueInner {
    async fn consume(self: Arc<Self>, consumer: usize, cancel: CancellationToken) {
        debug!(consumer, "消费循环启动");
        let poll_interval = self.config.poll_interval();

        while !cancel.is_cancelled() {
            match self
                .store
                .pop_lease(self.worker_id.as_deref(), self.config.lease_grace())
                .await
            {
                Ok(Some(leased)) => {
                    self.deliver(leased).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(consumer, error = %e, "弹出任务失败"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        debug!(consumer, "消费循环退出");
    }

    /// 询问路由器任务应当投递到哪个Worker，路由失败时按公共任务处理
    async fn route(&self, task: &Task) -> Option<String> {
        let router = self.router.read().await.clone()?;
        match router.route(task).await {
            Ok(target) => target,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "任务路由失败，按公共任务投递");
                None
            }
        }
    }

    /// 公共任务属于另一个Worker时转入其分区，返回是否已转交
    async fn hand_over(&self, envelope: &TaskEnvelope, lease: &Lease) -> bool {
        let Some(me) = self.worker_id.as_deref() else {
            return false;
        };
        if envelope.target_worker.is_some() {
            return false;
        }
        let Some(owner) = self.route(&envelope.task).await else {
            return false;
        };
        if owner == me {
            return false;
        }

        let mut routed = envelope.clone();
        routed.target_worker = Some(owner.clone());
        routed.not_before = None;
        match self.store.retry(lease, &routed).await {
            Ok(true) => {
                info!(task_id = %envelope.id(), target_worker = %owner, "任务转交给所属Worker");
                metrics::counter!("vmfleet_tasks_rerouted_total").increment(1);
                true
            }
            Ok(false) => {
                warn!(task_id = %envelope.id(), "租约已失效，转交被忽略");
                true
            }
            Err(e) => {
                error!(task_id = %envelope.id(), error = %e, "转交任务失败，等待租约回收");
                true
            }
        }
    }

    /// 执行一次投递并根据结果确认、重试或终止
    async fn deliver(&self, leased: LeasedTask) {
        let LeasedTask { envelope, lease } = leased;
        if self.hand_over(&envelope, &lease).await {
            return;
        }
        let task = envelope.task.clone();
        let timeout = envelope.timeout();
        let ctx = TaskContext {
            delivery: envelope.attempts + 1,
            max_retry: envelope.max_retry,
            tier: envelope.tier,
            timeout,
        };

        let handler = self.handlers.read().await.get(&task.task_type).cloned();
        let started = std::time::Instant::now();
        let outcome = match handler {
            None => Err(format!("没有为任务类型 {} 注册处理器", task.task_type)),
            Some(handler) => {
                debug!(task_id = %task.id, delivery = ctx.delivery, "开始投递任务");
                let mut invocation = {
                    let task = task.clone();
                    let ctx = ctx.clone();
                    tokio::spawn(async move { handler.handle(&task, &ctx).await })
                };
                match tokio::time::timeout(timeout, &mut invocation).await {
                    Ok(Ok(Ok(result))) => Ok(result),
                    Ok(Ok(Err(e))) => Err(e.to_string()),
                    Ok(Err(join_error)) if join_error.is_panic() => {
                        Err(format!("任务处理器panic: {join_error}"))
                    }
                    Ok(Err(join_error)) => Err(format!("任务处理器被取消: {join_error}")),
                    Err(_) => {
                        self.track_overdue(&task.id, invocation).await;
                        Err(format!("任务处理器执行超时({}ms)", timeout.as_millis()))
                    }
                }
            }
        };
        metrics::histogram!("vmfleet_task_duration_seconds").record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(result) => self.complete(&envelope, &lease, ctx.delivery, result).await,
            Err(reason) => self.settle_failure(envelope, &lease, reason).await,
        }
    }

    async fn complete(
        &self,
        envelope: &TaskEnvelope,
        lease: &Lease,
        delivery: u32,
        result: serde_json::Value,
    ) {
        match self.store.ack(lease).await {
            Ok(true) => {}
            Ok(false) => warn!(task_id = %envelope.id(), "租约已失效，确认被忽略"),
            Err(e) => {
                error!(task_id = %envelope.id(), error = %e, "确认任务失败，任务可能被重复投递");
                return;
            }
        }

        info!(task_id = %envelope.id(), delivery, "任务执行成功");
        metrics::counter!("vmfleet_tasks_completed_total").increment(1);
        self.publish(
            topics::TASK_COMPLETED,
            serde_json::json!({
                "task_id": envelope.id(),
                "task_type": envelope.task.task_type,
                "delivery": delivery,
                "result": result,
            }),
        )
        .await;
    }

    /// 记录一次失败，然后重新入队或移入终止失败集合
    async fn settle_failure(&self, mut envelope: TaskEnvelope, lease: &Lease, reason: String) {
        let retryable = envelope.record_failure(reason.clone());

        if retryable {
            envelope.not_before = self
                .retry_policy
                .next_attempt_at(envelope.attempts, Utc::now());
            match self.store.retry(lease, &envelope).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(task_id = %envelope.id(), "租约已失效，重试被忽略");
                    return;
                }
                Err(e) => {
                    error!(task_id = %envelope.id(), error = %e, "任务重新入队失败");
                    return;
                }
            }
            warn!(
                task_id = %envelope.id(),
                attempts = envelope.attempts,
                max_retry = envelope.max_retry,
                error = %reason,
                "任务执行失败，等待重试"
            );
            metrics::counter!("vmfleet_tasks_retried_total").increment(1);
            self.wakeup.notify_one();
            self.publish(
                topics::TASK_RETRYING,
                serde_json::json!({
                    "task_id": envelope.id(),
                    "task_type": envelope.task.task_type,
                    "attempts": envelope.attempts,
                    "error": reason,
                    "not_before": envelope.not_before,
                }),
            )
            .await;
        } else {
            match self.store.fail(lease, &envelope).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(task_id = %envelope.id(), "租约已失效，终止失败被忽略");
                    return;
                }
                Err(e) => {
                    error!(task_id = %envelope.id(), error = %e, "记录终止失败出错");
                    return;
                }
            }
            error!(
                task_id = %envelope.id(),
                attempts = envelope.attempts,
                error = %reason,
                "任务重试次数耗尽，已标记为失败"
            );
            metrics::counter!("vmfleet_tasks_failed_total").increment(1);
            self.publish(
                topics::TASK_FAILED,
                serde_json::json!({
                    "task_id": envelope.id(),
                    "task_type": envelope.task.task_type,
                    "attempts": envelope.attempts,
                    "error": reason,
                }),
            )
            .await;
        }
    }

    /// 记录超时后仍在运行的处理器，停止队列时等待它们结束
    async fn track_overdue(
        &self,
        task_id: &str,
        invocation: JoinHandle<FleetResult<serde_json::Value>>,
    ) {
        let mut overdue = self.overdue.lock().await;
        overdue.retain(|(_, handle)| !handle.is_finished());
        overdue.push((task_id.to_string(), invocation));
    }

    /// 等待超时的处理器结束，超过租约宽限后中止剩余的处理器
    async fn drain_overdue(&self) {
        let overdue = std::mem::take(&mut *self.overdue.lock().await);
        if overdue.is_empty() {
            return;
        }
        info!(count = overdue.len(), "等待超时的任务处理器结束");
        let deadline = tokio::time::Instant::now() + self.config.lease_grace();
        for (task_id, mut handle) in overdue {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(_))) => debug!(task_id = %task_id, "超时的处理器最终执行完成"),
                Ok(Ok(Err(e))) => debug!(task_id = %task_id, error = %e, "超时的处理器最终执行失败"),
                Ok(Err(e)) => warn!(task_id = %task_id, error = %e, "超时的处理器异常退出"),
                Err(_) => {
                    warn!(task_id = %task_id, "超时的任务处理器未能在宽限期内结束，已中止");
                    handle.abort();
                }
            }
        }
    }

    /// 回收消费者崩溃后遗留的租约
    ///
    /// 租约截止时间是弹出时间加宽限，超过截止时间再加上任务超时才视为遗留。
    async fn reap(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reaper_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reclaim_expired().await {
                        warn!(error = %e, "回收过期租约失败");
                    }
                }
            }
        }
    }

    async fn reclaim_expired(&self) -> FleetResult<usize> {
        let now = Utc::now();
        let mut reclaimed = 0;
        for leased in self.store.expired_leases(now).await? {
            let timeout = chrono::Duration::milliseconds(leased.envelope.timeout_ms as i64);
            if leased.lease.deadline + timeout >= now {
                continue;
            }
            warn!(task_id = %leased.envelope.id(), "租约过期，回收任务");
            metrics::counter!("vmfleet_tasks_reclaimed_total").increment(1);
            self.settle_failure(
                leased.envelope,
                &leased.lease,
                "租约过期，消费者可能已崩溃".to_string(),
            )
            .await;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    async fn publish(&self, topic: &str, payload: serde_json::Value) {
        if let Err(e) = self.event_bus.publish(topic, payload).await {
            warn!(topic, error = %e, "发布任务事件失败");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmfleet_infrastructure::{InMemoryEventBus, InMemoryQueueStore};
    use vmfleet_testing_utils::ScriptedTaskHandler;

    fn queue_with(store: Arc<InMemoryQueueStore>, config: QueueConfig) -> TaskQueue {
        TaskQueue::new(store, Arc::new(InMemoryEventBus::new()), config)
    }

    #[tokio::test]
    async fn test_reclaim_respects_task_timeout() {
        let store = Arc::new(InMemoryQueueStore::new());
        let config = QueueConfig {
            lease_grace_seconds: 0,
            retry: vmfleet_core::config::RetryConfig::immediate(),
            ..Default::default()
        };
        let queue = queue_with(store.clone(), config);

        let task = Task::new("t-1", "noop", serde_json::json!({}));
        queue
            .enqueue(task, EnqueueOptions::new(1, Duration::from_millis(50)))
            .await
            .unwrap();
        // 模拟消费者弹出后崩溃
        let leased = store.pop_lease(None, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(leased.envelope.id(), "t-1");

        assert_eq!(queue.inner.reclaim_expired().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(queue.inner.reclaim_expired().await.unwrap(), 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.total_pending(), 1);
    }

    #[tokio::test]
    async fn test_reclaim_exhausted_task_moves_to_failed() {
        let store = Arc::new(InMemoryQueueStore::new());
        let config = QueueConfig {
            lease_grace_seconds: 0,
            ..Default::default()
        };
        let queue = queue_with(store.clone(), config);
        queue
            .register_handler("noop", Arc::new(ScriptedTaskHandler::succeeding()))
            .await
            .unwrap();

        queue
            .enqueue(
                Task::new("t-1", "noop", serde_json::json!({})),
                EnqueueOptions::new(0, Duration::from_millis(10)),
            )
            .await
            .unwrap();
        store.pop_lease(None, Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(queue.inner.reclaim_expired().await.unwrap(), 1);
        let failed = queue.failed_tasks().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 1);
        assert!(failed[0].last_error.as_deref().unwrap_or("").contains("租约过期"));
    }
}
