use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vmfleet_core::config::WorkerConfig;
use vmfleet_core::models::{WorkerRegistration, WorkerStatus};
use vmfleet_dispatcher::{TaskQueue, WorkerRegistry};
use vmfleet_errors::{FleetError, FleetResult};

use crate::handlers::register_sandbox_handlers;
use crate::orchestrator::SandboxOrchestrator;

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    config: WorkerConfig,
    registry: Arc<WorkerRegistry>,
    queue: Arc<TaskQueue>,
    orchestrator: Arc<SandboxOrchestrator>,
    heartbeat_interval: Duration,
    hostname: Option<String>,
}

impl WorkerServiceBuilder {
    pub fn new(
        config: WorkerConfig,
        registry: Arc<WorkerRegistry>,
        queue: Arc<TaskQueue>,
        orchestrator: Arc<SandboxOrchestrator>,
    ) -> Self {
        Self {
            config,
            registry,
            queue,
            orchestrator,
            heartbeat_interval: Duration::from_secs(10),
            hostname: None,
        }
    }

    /// 设置心跳间隔
    pub fn heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    /// 设置主机名，默认取配置，配置为 `localhost` 时取本机主机名
    pub fn hostname(mut self, hostname: String) -> Self {
        self.hostname = Some(hostname);
        self
    }

    pub fn build(self) -> WorkerService {
        let hostname = self
            .hostname
            .unwrap_or_else(|| resolve_hostname(&self.config.hostname));
        WorkerService {
            config: self.config,
            hostname,
            registry: self.registry,
            queue: self.queue,
            orchestrator: self.orchestrator,
            heartbeat_interval: self.heartbeat_interval,
            handlers_registered: AtomicBool::new(false),
            heartbeat: Mutex::new(None),
        }
    }
}

fn resolve_hostname(configured: &str) -> String {
    if configured != "localhost" {
        return configured.to_string();
    }
    hostname::get()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|_| configured.to_string())
}

struct HeartbeatTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Worker服务
///
/// 启动顺序：注册（已存在时重新激活）→ 沙箱对账 → 心跳 → 注册处理器 → 启动队列消费。
/// 停止顺序相反：Draining → 停止队列 → 停止心跳 → 注销。
pub struct WorkerService {
    config: WorkerConfig,
    hostname: String,
    registry: Arc<WorkerRegistry>,
    queue: Arc<TaskQueue>,
    orchestrator: Arc<SandboxOrchestrator>,
    heartbeat_interval: Duration,
    handlers_registered: AtomicBool,
    heartbeat: Mutex<Option<HeartbeatTask>>,
}

impl WorkerService {
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn orchestrator(&self) -> &Arc<SandboxOrchestrator> {
        &self.orchestrator
    }

    pub async fn is_running(&self) -> bool {
        self.heartbeat.lock().await.is_some()
    }

    /// 注册请求，能力集合取自实际启用的沙箱后端
    pub fn registration(&self) -> WorkerRegistration {
        let capabilities = BTreeSet::from([self.orchestrator.backend_name().to_string()]);
        let mut registration = self.config.registration(capabilities);
        registration.hostname = self.hostname.clone();
        registration
    }

    pub async fn start(&self) -> FleetResult<()> {
        let mut heartbeat = self.heartbeat.lock().await;
        if heartbeat.is_some() {
            return Err(FleetError::InvalidState(format!(
                "Worker {} 已在运行",
                self.worker_id()
            )));
        }

        info!(worker_id = %self.worker_id(), hostname = %self.hostname, "启动Worker服务");
        if self.queue.worker_id() != Some(self.worker_id()) {
            warn!(
                worker_id = %self.worker_id(),
                queue_worker = ?self.queue.worker_id(),
                "任务队列没有以本Worker身份运行，收不到定向给本Worker的任务"
            );
        }
        Self::register_or_reactivate(&self.registry, self.registration()).await?;
        let report = self.orchestrator.reconcile().await?;
        if !report.orphans_destroyed.is_empty() {
            warn!(orphans = ?report.orphans_destroyed, "启动对账销毁了遗留的沙箱实例");
        }

        *heartbeat = Some(self.spawn_heartbeat());

        if !self.handlers_registered.swap(true, Ordering::SeqCst) {
            register_sandbox_handlers(&self.queue, self.orchestrator.clone()).await?;
        }
        self.queue.start().await?;

        info!(worker_id = %self.worker_id(), "Worker服务已启动");
        Ok(())
    }

    pub async fn stop(&self) -> FleetResult<()> {
        let Some(heartbeat) = self.heartbeat.lock().await.take() else {
            return Ok(());
        };
        info!(worker_id = %self.worker_id(), "正在停止Worker服务");

        // 先退出调度，不再被选中
        if let Err(e) = self
            .registry
            .update_status(self.worker_id(), WorkerStatus::Draining)
            .await
        {
            warn!(worker_id = %self.worker_id(), error = %e, "标记Draining失败");
        }

        self.queue.stop().await?;

        heartbeat.cancel.cancel();
        if let Err(e) = heartbeat.handle.await {
            error!(error = %e, "心跳任务异常退出");
        }

        self.registry.deregister(self.worker_id()).await?;
        info!(worker_id = %self.worker_id(), "Worker服务已停止");
        Ok(())
    }

    async fn register_or_reactivate(
        registry: &WorkerRegistry,
        registration: WorkerRegistration,
    ) -> FleetResult<()> {
        let worker_id = registration.worker_id.clone();
        match registry.register(registration).await {
            Ok(_) => Ok(()),
            Err(FleetError::AlreadyExists { .. }) => {
                debug!(worker_id = %worker_id, "Worker已注册，重新激活");
                registry.heartbeat(&worker_id).await?;
                registry
                    .update_status(&worker_id, WorkerStatus::Active)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_heartbeat(&self) -> HeartbeatTask {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let registry = self.registry.clone();
        let orchestrator = self.orchestrator.clone();
        let registration = self.registration();
        let period = self.heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("心跳任务退出");
                        break;
                    }
                    _ = ticker.tick() => {
                        Self::beat(&registry, &orchestrator, &registration).await;
                    }
                }
            }
        });

        HeartbeatTask { cancel, handle }
    }

    async fn beat(
        registry: &WorkerRegistry,
        orchestrator: &SandboxOrchestrator,
        registration: &WorkerRegistration,
    ) {
        let worker_id = &registration.worker_id;
        match registry.heartbeat(worker_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                // 被清理出成员列表后重新注册，并用本地沙箱重建资源记账
                warn!(worker_id = %worker_id, "Worker记录已被移除，重新注册");
                if let Err(e) = Self::register_or_reactivate(registry, registration.clone()).await {
                    error!(worker_id = %worker_id, error = %e, "重新注册失败");
                    return;
                }
                if let Err(e) = orchestrator.reconcile().await {
                    error!(worker_id = %worker_id, error = %e, "重新注册后的对账失败");
                }
            }
            Err(e) => warn!(worker_id = %worker_id, error = %e, "发送心跳失败"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use vmfleet_core::config::{QueueConfig, RetryConfig};
    use vmfleet_core::models::{task_types, EnqueueOptions, SandboxStatus};
    use vmfleet_infrastructure::{InMemoryEventBus, InMemoryQueueStore};
    use vmfleet_testing_utils::{MockSandboxBackend, TaskBuilder, TestEnv};

    use crate::bootstrap::{BootstrapInstaller, ToolCatalog};
    use crate::orchestrator::OrchestratorSettings;

    struct Fixture {
        service: WorkerService,
        registry: Arc<WorkerRegistry>,
        queue: Arc<TaskQueue>,
        backend: Arc<MockSandboxBackend>,
    }

    fn fixture(registry: Arc<WorkerRegistry>) -> Fixture {
        let backend = Arc::new(MockSandboxBackend::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let queue = Arc::new(TaskQueue::for_worker(
            Arc::new(InMemoryQueueStore::new()),
            bus.clone(),
            QueueConfig {
                concurrency: 2,
                poll_interval_ms: 10,
                retry: RetryConfig::immediate(),
                ..Default::default()
            },
            "worker-1",
        ));
        let orchestrator = Arc::new(SandboxOrchestrator::new(
            "worker-1",
            backend.clone(),
            registry.clone(),
            bus,
            BootstrapInstaller::new(ToolCatalog::builtin(), Vec::new(), Duration::from_secs(1)),
            OrchestratorSettings {
                startup_timeout: Duration::from_millis(200),
                probe_interval: Duration::from_millis(10),
                command_timeout: Duration::from_secs(1),
            },
        ));
        let config = WorkerConfig {
            worker_id: "worker-1".to_string(),
            hostname: "node-a".to_string(),
            ..Default::default()
        };
        let service = WorkerServiceBuilder::new(config, registry.clone(), queue.clone(), orchestrator)
            .heartbeat_interval(Duration::from_millis(20))
            .build();
        Fixture {
            service,
            registry,
            queue,
            backend,
        }
    }

    #[tokio::test]
    async fn test_start_registers_with_backend_capability() {
        let f = fixture(Arc::new(WorkerRegistry::new(Duration::from_secs(30))));
        f.service.start().await.unwrap();

        let worker = f.registry.get("worker-1").await.unwrap();
        assert_eq!(worker.hostname, "node-a");
        assert!(worker.capabilities.contains("mock"));
        assert!(f.service.orchestrator().is_reconciled());
        assert_eq!(
            f.queue.registered_types().await,
            vec![
                task_types::SANDBOX_CREATE,
                task_types::SANDBOX_DELETE,
                task_types::SANDBOX_EXECUTE,
            ]
        );
        assert!(matches!(
            f.service.start().await,
            Err(FleetError::InvalidState(_))
        ));

        f.service.stop().await.unwrap();
        assert!(f.registry.get("worker-1").await.is_none());
        f.service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_task_flows_through_queue() {
        let f = fixture(Arc::new(WorkerRegistry::new(Duration::from_secs(30))));
        f.service.start().await.unwrap();

        let task = TaskBuilder::new(task_types::SANDBOX_CREATE)
            .with_id("sb-task")
            .with_payload(serde_json::json!({
                "config": { "vcpus": 2, "memory_mb": 1024, "image": "base", "include_default_tools": false }
            }))
            .build();
        f.queue
            .enqueue(task, EnqueueOptions::new(1, Duration::from_secs(5)))
            .await
            .unwrap();

        let orchestrator = f.service.orchestrator().clone();
        assert!(
            TestEnv::wait_for(
                move || {
                    let orchestrator = orchestrator.clone();
                    async move {
                        orchestrator
                            .get_sandbox("sb-task")
                            .await
                            .map(|s| s.status == SandboxStatus::Running && s.ready)
                            .unwrap_or(false)
                    }
                },
                Duration::from_secs(3),
            )
            .await
        );
        let worker = f.registry.get("worker-1").await.unwrap();
        assert_eq!(worker.resources.usage.cpu_cores, 2);
        assert_eq!(f.backend.instance_count(), 1);

        f.service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_reactivates_existing_record() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        let first = fixture(registry.clone());
        first.service.start().await.unwrap();
        registry
            .update_status("worker-1", WorkerStatus::Draining)
            .await
            .unwrap();

        // 同一个ID在另一个进程中启动
        let second = fixture(registry.clone());
        second.service.start().await.unwrap();
        assert_eq!(
            registry.get("worker-1").await.unwrap().status,
            WorkerStatus::Active
        );

        second.service.stop().await.unwrap();
        first.service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_reregisters_after_removal() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        let f = fixture(registry.clone());
        f.service.start().await.unwrap();

        registry.deregister("worker-1").await.unwrap();
        let probe = registry.clone();
        assert!(
            TestEnv::wait_for(
                move || {
                    let probe = probe.clone();
                    async move { probe.get("worker-1").await.is_some() }
                },
                Duration::from_secs(2),
            )
            .await
        );

        f.service.stop().await.unwrap();
    }
}
