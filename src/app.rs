use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vmfleet_core::models::{topics, Event};
use vmfleet_core::traits::EventHandler;
use vmfleet_core::{AppConfig, FleetResult};
use vmfleet_dispatcher::{ExpirySweeper, TaskQueue, WorkerRegistry};
use vmfleet_infrastructure::{BackendFactory, Backends};
use vmfleet_worker::{
    create_backend, BootstrapInstaller, OrchestratorSettings, SandboxDirectory,
    SandboxOrchestrator, SandboxTaskRouter, WorkerServiceBuilder,
};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 成员清理与存储同步
    Control,
    /// 执行沙箱任务
    Worker,
    /// 同一进程内运行全部组件
    All,
}

impl std::str::FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "control" => Ok(AppMode::Control),
            "worker" => Ok(AppMode::Worker),
            "all" => Ok(AppMode::All),
            other => Err(anyhow::anyhow!("不支持的运行模式: {other}")),
        }
    }
}

/// 把任务与沙箱事件写入日志的通知接收端
pub struct LoggingEventSink;

#[async_trait]
impl EventHandler for LoggingEventSink {
    async fn handle_event(&self, event: &Event) -> FleetResult<()> {
        if event.topic == topics::TASK_FAILED || event.topic == topics::VM_FAILED {
            warn!(topic = %event.topic, event_id = %event.id, payload = %event.payload, "事件");
        } else {
            info!(topic = %event.topic, event_id = %event.id, payload = %event.payload, "事件");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "logging-sink"
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    backends: Backends,
    registry: Arc<WorkerRegistry>,
    queue: Arc<TaskQueue>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        let backends = BackendFactory::create(&config.backend)
            .await
            .context("初始化存储后端失败")?;

        let registry = Arc::new(
            WorkerRegistry::from_config(&config.registry)
                .with_store(backends.registry_store.clone()),
        );
        let queue = Arc::new(match mode {
            AppMode::Control => TaskQueue::new(
                backends.queue_store.clone(),
                backends.event_bus.clone(),
                config.queue.clone(),
            ),
            AppMode::Worker | AppMode::All => TaskQueue::for_worker(
                backends.queue_store.clone(),
                backends.event_bus.clone(),
                config.queue.clone(),
                config.worker.worker_id.clone(),
            ),
        });
        queue
            .set_router(Arc::new(SandboxTaskRouter::new(SandboxDirectory::new(
                backends.registry_store.clone(),
            ))))
            .await;

        Ok(Self {
            config,
            mode,
            backends,
            registry,
            queue,
        })
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}，后端: {}", self.mode, self.backends.kind());

        let sink: Arc<dyn EventHandler> = Arc::new(LoggingEventSink);
        for topic in [topics::TASK_COMPLETED, topics::TASK_FAILED, topics::VM_ALL] {
            self.backends
                .event_bus
                .subscribe(topic, sink.clone())
                .await
                .with_context(|| format!("订阅事件主题 {topic} 失败"))?;
        }

        let result = match self.mode {
            AppMode::Control => self.run_control(shutdown_rx).await,
            AppMode::Worker => self.run_worker(shutdown_rx).await,
            AppMode::All => {
                let (control, worker) = tokio::join!(
                    self.run_control(shutdown_rx.resubscribe()),
                    self.run_worker(shutdown_rx)
                );
                control.and(worker)
            }
        };

        if let Err(e) = self.backends.event_bus.shutdown().await {
            warn!("关闭事件总线失败: {e}");
        }
        result
    }

    /// 运行控制面：从存储同步成员，定期清理心跳超时的Worker
    async fn run_control(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动控制面服务");

        let synced = self
            .registry
            .sync_from_store()
            .await
            .context("从注册存储同步Worker失败")?;
        info!("从注册存储同步了 {synced} 个Worker");

        let cancel = CancellationToken::new();
        let sweeper = ExpirySweeper::new(self.registry.clone(), self.config.registry.sweep_interval())
            .spawn(cancel.clone());
        let follower = {
            let registry = self.registry.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = registry.follow_store(cancel).await {
                    error!("跟随注册存储变更失败: {e}");
                }
            })
        };

        let _ = shutdown_rx.recv().await;
        info!("控制面收到关闭信号");

        cancel.cancel();
        let _ = tokio::join!(sweeper, follower);

        info!("控制面服务已停止");
        Ok(())
    }

    /// 运行Worker：注册自身、对账并消费沙箱任务
    async fn run_worker(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动Worker服务: {}", self.config.worker.worker_id);

        let backend = create_backend(&self.config.sandbox).context("创建沙箱后端失败")?;
        let orchestrator = Arc::new(SandboxOrchestrator::new(
            self.config.worker.worker_id.clone(),
            backend,
            self.registry.clone(),
            self.backends.event_bus.clone(),
            BootstrapInstaller::from_settings(&self.config.sandbox),
            OrchestratorSettings::from(&self.config.sandbox),
        )
        .with_directory(SandboxDirectory::new(self.backends.registry_store.clone())));

        let worker_service = WorkerServiceBuilder::new(
            self.config.worker.clone(),
            self.registry.clone(),
            self.queue.clone(),
            orchestrator,
        )
        .heartbeat_interval(self.config.registry.heartbeat_interval())
        .build();

        worker_service.start().await.context("启动Worker服务失败")?;

        let _ = shutdown_rx.recv().await;
        info!("Worker收到关闭信号");

        worker_service.stop().await.context("停止Worker服务失败")?;
        info!("Worker服务已停止");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_app_mode() {
        assert_eq!("control".parse::<AppMode>().unwrap(), AppMode::Control);
        assert_eq!("all".parse::<AppMode>().unwrap(), AppMode::All);
        assert!("dispatcher".parse::<AppMode>().is_err());
    }

    #[tokio::test]
    async fn test_all_mode_starts_and_stops_on_signal() {
        let workdir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.sandbox.workdir_root = workdir.path().display().to_string();
        config.worker.worker_id = "worker-test".to_string();

        let app = Arc::new(Application::new(config, AppMode::All).await.unwrap());
        let (tx, rx) = broadcast::channel(1);
        let handle = {
            let app = app.clone();
            tokio::spawn(async move { app.run(rx).await })
        };

        let registry = app.registry.clone();
        let mut registered = false;
        for _ in 0..100 {
            if registry.get("worker-test").await.is_some() {
                registered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(registered);

        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(registry.get("worker-test").await.is_none());
    }
}
