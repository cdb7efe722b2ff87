use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use vmfleet_core::config::BackendKind;
use vmfleet_core::models::{EnqueueOptions, QueueTier, Task};
use vmfleet_core::AppConfig;
use vmfleet_dispatcher::{TaskQueue, WorkerRegistry};
use vmfleet_infrastructure::{BackendFactory, Backends};
use vmfleet_worker::{SandboxDirectory, SandboxTaskRouter};

/// vmfleet 命令行工具
#[derive(Parser, Debug)]
#[command(name = "vmfleet-cli")]
#[command(version)]
#[command(about = "沙箱集群控制平面 - 命令行管理工具")]
#[command(long_about = "直接连接配置中的存储后端，提交任务并查看队列与Worker状态")]
struct CliApp {
    #[command(subcommand)]
    command: Commands,

    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 提交任务
    Submit {
        /// 任务类型，例如 sandbox-create
        #[arg(short = 't', long = "type")]
        task_type: String,
        /// 任务负载 (JSON格式)
        #[arg(short, long, default_value = "{}")]
        payload: String,
        /// 任务ID，省略时自动生成
        #[arg(long)]
        id: Option<String>,
        /// 最大重试次数，省略时使用配置
        #[arg(short = 'r', long)]
        max_retry: Option<u32>,
        /// 单次投递超时 (秒)，省略时使用配置
        #[arg(long)]
        timeout: Option<u64>,
        /// 队列层级: critical, high, default, low
        #[arg(long, conflicts_with = "priority")]
        tier: Option<String>,
        /// 数值优先级，按阈值映射到层级
        #[arg(long)]
        priority: Option<i32>,
        /// 只投递给指定Worker，省略时按沙箱归属定向
        #[arg(long)]
        worker: Option<String>,
    },
    /// 列出最终失败的任务
    Failed,
    /// 队列统计
    Stats,
    /// 列出已注册的Worker
    Workers,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = CliApp::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("加载配置失败")?;
    if config.backend.kind == BackendKind::Memory {
        eprintln!("警告: 当前为内存后端，命令行工具看不到守护进程中的数据");
    }

    let backends = BackendFactory::create(&config.backend)
        .await
        .context("连接存储后端失败")?;
    let output = run(cli.command, &config, &backends).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(command: Commands, config: &AppConfig, backends: &Backends) -> Result<Value> {
    let queue = TaskQueue::new(
        backends.queue_store.clone(),
        backends.event_bus.clone(),
        config.queue.clone(),
    );
    queue
        .set_router(Arc::new(SandboxTaskRouter::new(SandboxDirectory::new(
            backends.registry_store.clone(),
        ))))
        .await;

    match command {
        Commands::Submit {
            task_type,
            payload,
            id,
            max_retry,
            timeout,
            tier,
            priority,
            worker,
        } => {
            let payload: Value =
                serde_json::from_str(&payload).context("任务负载不是合法的JSON")?;
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            let mut options = queue.default_options();
            if let Some(max_retry) = max_retry {
                options.max_retry = max_retry;
            }
            if let Some(seconds) = timeout {
                options.timeout = Duration::from_secs(seconds);
            }
            if let Some(tier) = tier {
                options = options.with_tier(tier.parse::<QueueTier>()?);
            }
            if let Some(priority) = priority {
                options = options.with_priority(priority);
            }
            if let Some(worker) = worker {
                options = options.with_target_worker(worker);
            }
            let tier = options.resolve_tier();

            let accepted = submit(&queue, Task::new(id.clone(), task_type, payload), options).await?;
            Ok(json!({
                "task_id": id,
                "tier": tier,
                "accepted": accepted,
            }))
        }
        Commands::Failed => {
            let failed = queue.failed_tasks().await.context("读取失败任务失败")?;
            Ok(serde_json::to_value(failed)?)
        }
        Commands::Stats => {
            let stats = queue.stats().await.context("读取队列统计失败")?;
            Ok(json!({
                "backend": backends.kind(),
                "total_pending": stats.total_pending(),
                "stats": stats,
            }))
        }
        Commands::Workers => {
            let registry = WorkerRegistry::from_config(&config.registry)
                .with_store(Arc::clone(&backends.registry_store));
            registry
                .sync_from_store()
                .await
                .context("读取Worker列表失败")?;
            Ok(serde_json::to_value(registry.list_workers().await)?)
        }
    }
}

async fn submit(queue: &TaskQueue, task: Task, options: EnqueueOptions) -> Result<bool> {
    let task_id = task.id.clone();
    let accepted = queue
        .enqueue(task, options)
        .await
        .with_context(|| format!("提交任务 {task_id} 失败"))?;
    if !accepted {
        eprintln!("任务 {task_id} 已在队列中，忽略重复提交");
    }
    Ok(accepted)
}
