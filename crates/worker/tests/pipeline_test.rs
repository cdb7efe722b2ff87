#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use vmfleet_core::config::{QueueConfig, RetryConfig};
    use vmfleet_core::models::{task_types, topics, EnqueueOptions, SandboxStatus, Task};
    use vmfleet_core::traits::{EventBus, QueueStore};
    use vmfleet_dispatcher::{TaskQueue, WorkerRegistry};
    use vmfleet_infrastructure::{InMemoryEventBus, InMemoryQueueStore, InMemoryRegistryStore};
    use vmfleet_testing_utils::{
        MockSandboxBackend, RecordingEventHandler, SandboxConfigBuilder, TestEnv,
        WorkerRegistrationBuilder,
    };
    use vmfleet_worker::bootstrap::{BootstrapInstaller, ToolCatalog};
    use vmfleet_worker::orchestrator::{OrchestratorSettings, SandboxOrchestrator};
    use vmfleet_worker::{register_sandbox_handlers, SandboxDirectory, SandboxTaskRouter};

    fn queue_config() -> QueueConfig {
        QueueConfig {
            concurrency: 1,
            poll_interval_ms: 10,
            reaper_interval_seconds: 60,
            retry: RetryConfig::immediate(),
            ..Default::default()
        }
    }

    fn orchestrator(
        worker_id: &str,
        backend: Arc<MockSandboxBackend>,
        registry: Arc<WorkerRegistry>,
        bus: Arc<InMemoryEventBus>,
    ) -> SandboxOrchestrator {
        SandboxOrchestrator::new(
            worker_id,
            backend,
            registry,
            bus,
            BootstrapInstaller::new(ToolCatalog::builtin(), Vec::new(), Duration::from_secs(2)),
            OrchestratorSettings {
                startup_timeout: Duration::from_millis(300),
                probe_interval: Duration::from_millis(10),
                command_timeout: Duration::from_secs(2),
            },
        )
    }

    async fn usage(registry: &WorkerRegistry, worker_id: &str) -> (u32, u64, u32) {
        let worker = registry.get(worker_id).await.unwrap();
        (
            worker.resources.usage.cpu_cores,
            worker.resources.usage.memory_mb,
            worker.resources.usage.running_sandboxes,
        )
    }

    fn create_task(id: &str, sandbox_id: &str) -> Task {
        Task::new(
            id,
            task_types::SANDBOX_CREATE,
            serde_json::json!({
                "sandbox_id": sandbox_id,
                "config": {
                    "vcpus": 1,
                    "memory_mb": 512,
                    "image": "base",
                    "tools": [{ "name": "git" }],
                    "include_default_tools": false
                }
            }),
        )
    }

    fn delete_task(id: &str, sandbox_id: &str) -> Task {
        Task::new(
            id,
            task_types::SANDBOX_DELETE,
            serde_json::json!({ "sandbox_id": sandbox_id }),
        )
    }

    #[tokio::test]
    async fn test_create_retried_through_queue_until_bootstrap_succeeds() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        registry
            .register(
                WorkerRegistrationBuilder::new("worker-1")
                    .with_capacity(4, 4096)
                    .build(),
            )
            .await
            .unwrap();

        let bus = Arc::new(InMemoryEventBus::new());
        let task_events = Arc::new(RecordingEventHandler::new());
        bus.subscribe("task.*", task_events.clone()).await.unwrap();

        let backend = Arc::new(MockSandboxBackend::new().with_command_failures("git --version", 2, 1));
        let orchestrator = Arc::new(orchestrator(
            "worker-1",
            backend.clone(),
            registry.clone(),
            bus.clone(),
        ));
        orchestrator.reconcile().await.unwrap();

        let queue = TaskQueue::for_worker(
            Arc::new(InMemoryQueueStore::new()),
            bus,
            queue_config(),
            "worker-1",
        );
        register_sandbox_handlers(&queue, orchestrator.clone()).await.unwrap();
        queue
            .enqueue(
                create_task("create-1", "sb-1"),
                EnqueueOptions::new(2, Duration::from_secs(5)),
            )
            .await
            .unwrap();
        queue.start().await.unwrap();

        assert!(task_events.wait_for(3, Duration::from_secs(5)).await);
        queue.stop().await.unwrap();

        assert_eq!(
            task_events.topics(),
            vec![
                topics::TASK_RETRYING.to_string(),
                topics::TASK_RETRYING.to_string(),
                topics::TASK_COMPLETED.to_string(),
            ]
        );
        let completed = &task_events.events()[2];
        assert_eq!(completed.payload["delivery"], 3);
        assert_eq!(completed.payload["result"]["ready"], true);

        let sandboxes = orchestrator.list_sandboxes().await;
        assert_eq!(sandboxes.len(), 1);
        assert_eq!(sandboxes[0].status, SandboxStatus::Running);
        assert!(sandboxes[0].ready);

        // 两次失败的实例都已销毁，资源只记一次
        assert_eq!(backend.destroyed().len(), 2);
        assert_eq!(backend.instance_count(), 1);
        assert_eq!(usage(&registry, "worker-1").await, (1, 512, 1));
        assert!(queue.failed_tasks().await.unwrap().is_empty());
    }

    struct Node {
        orchestrator: Arc<SandboxOrchestrator>,
        queue: TaskQueue,
    }

    async fn node(
        worker_id: &str,
        registry: &Arc<WorkerRegistry>,
        registry_store: &Arc<InMemoryRegistryStore>,
        queue_store: &Arc<InMemoryQueueStore>,
        bus: &Arc<InMemoryEventBus>,
    ) -> Node {
        registry
            .register(
                WorkerRegistrationBuilder::new(worker_id)
                    .with_capacity(4, 4096)
                    .build(),
            )
            .await
            .unwrap();
        let directory = SandboxDirectory::new(registry_store.clone());
        let orchestrator = Arc::new(
            orchestrator(
                worker_id,
                Arc::new(MockSandboxBackend::new()),
                registry.clone(),
                bus.clone(),
            )
            .with_directory(directory.clone()),
        );
        orchestrator.reconcile().await.unwrap();

        let queue = TaskQueue::for_worker(queue_store.clone(), bus.clone(), queue_config(), worker_id);
        queue
            .set_router(Arc::new(SandboxTaskRouter::new(directory)))
            .await;
        register_sandbox_handlers(&queue, orchestrator.clone()).await.unwrap();
        Node {
            orchestrator,
            queue,
        }
    }

    #[tokio::test]
    async fn test_sandbox_tasks_follow_the_owning_worker() {
        let registry_store = Arc::new(InMemoryRegistryStore::new());
        let registry = Arc::new(
            WorkerRegistry::new(Duration::from_secs(30)).with_store(registry_store.clone()),
        );
        let queue_store = Arc::new(InMemoryQueueStore::new());
        let bus = Arc::new(InMemoryEventBus::new());

        let owner = node("worker-1", &registry, &registry_store, &queue_store, &bus).await;
        let other = node("worker-2", &registry, &registry_store, &queue_store, &bus).await;

        owner
            .orchestrator
            .create_sandbox(
                "sb-1",
                SandboxConfigBuilder::new()
                    .with_resources(1, 512)
                    .build(),
            )
            .await
            .unwrap();

        // 一个任务由挂了路由器的提交方定向，另一个以公共任务提交
        let routed_submitter = TaskQueue::new(queue_store.clone(), bus.clone(), queue_config());
        routed_submitter
            .set_router(Arc::new(SandboxTaskRouter::new(SandboxDirectory::new(
                registry_store.clone(),
            ))))
            .await;
        routed_submitter
            .enqueue(delete_task("delete-1", "sb-1"), EnqueueOptions::new(0, Duration::from_secs(5)))
            .await
            .unwrap();
        let plain_submitter = TaskQueue::new(queue_store.clone(), bus.clone(), queue_config());
        plain_submitter
            .enqueue(delete_task("delete-2", "sb-1"), EnqueueOptions::new(0, Duration::from_secs(5)))
            .await
            .unwrap();

        other.queue.start().await.unwrap();
        let stats_store = queue_store.clone();
        assert!(
            TestEnv::wait_for(
                move || {
                    let store = stats_store.clone();
                    async move {
                        store.stats().await.unwrap().targeted == 2
                    }
                },
                Duration::from_secs(2),
            )
            .await
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            owner.orchestrator.get_sandbox("sb-1").await.unwrap().status,
            SandboxStatus::Running
        );
        assert_eq!(usage(&registry, "worker-1").await, (1, 512, 1));

        owner.queue.start().await.unwrap();
        let orchestrator = owner.orchestrator.clone();
        assert!(
            TestEnv::wait_for(
                move || {
                    let orchestrator = orchestrator.clone();
                    async move {
                        orchestrator
                            .get_sandbox("sb-1")
                            .await
                            .map(|s| s.status == SandboxStatus::Stopped)
                            .unwrap_or(false)
                    }
                },
                Duration::from_secs(3),
            )
            .await
        );
        let drained = queue_store.clone();
        assert!(
            TestEnv::wait_for(
                move || {
                    let store = drained.clone();
                    async move {
                        let stats = store.stats().await.unwrap();
                        stats.total_pending() == 0 && stats.leased == 0
                    }
                },
                Duration::from_secs(3),
            )
            .await
        );

        owner.queue.stop().await.unwrap();
        other.queue.stop().await.unwrap();

        assert_eq!(usage(&registry, "worker-1").await, (0, 0, 0));
        assert_eq!(usage(&registry, "worker-2").await, (0, 0, 0));
        assert!(owner.queue.failed_tasks().await.unwrap().is_empty());
        assert!(other.orchestrator.list_sandboxes().await.is_empty());
    }

    #[tokio::test]
    async fn test_ownership_is_claimed_on_create_and_cleaned_up() {
        let registry_store = Arc::new(InMemoryRegistryStore::new());
        let registry = Arc::new(
            WorkerRegistry::new(Duration::from_secs(30)).with_store(registry_store.clone()),
        );
        let queue_store = Arc::new(InMemoryQueueStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let owner = node("worker-1", &registry, &registry_store, &queue_store, &bus).await;
        let other = node("worker-2", &registry, &registry_store, &queue_store, &bus).await;
        let directory = SandboxDirectory::new(registry_store.clone());
        let config = || SandboxConfigBuilder::new().with_resources(1, 512).build();

        owner.orchestrator.create_sandbox("sb-1", config()).await.unwrap();
        assert_eq!(
            directory.owner("sb-1").await.unwrap().unwrap().worker_id,
            "worker-1"
        );

        // 同一ID不能在另一个Worker上再创建，也不占用那边的资源
        let err = other.orchestrator.create_sandbox("sb-1", config()).await.unwrap_err();
        assert!(matches!(err, vmfleet_errors::FleetError::AlreadyExists { .. }));
        assert!(other.orchestrator.get_sandbox("sb-1").await.is_none());
        assert_eq!(usage(&registry, "worker-2").await, (0, 0, 0));

        owner.orchestrator.delete_sandbox("sb-1").await.unwrap();
        assert!(directory.owner("sb-1").await.unwrap().is_some());
        assert!(owner.orchestrator.forget_terminated("sb-1").await.unwrap());
        assert!(directory.owner("sb-1").await.unwrap().is_none());

        // 重启后本地没有记录的归属在对账时清理
        directory.claim("sb-stale", "worker-1").await.unwrap();
        let report = owner.orchestrator.reconcile().await.unwrap();
        assert_eq!(report.stale_claims, vec!["sb-stale".to_string()]);
        assert!(directory.owned_by("worker-1").await.unwrap().is_empty());
    }
}
