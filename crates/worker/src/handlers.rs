//! 沙箱任务处理器
//!
//! 把 `sandbox-create`、`sandbox-execute`、`sandbox-delete` 三类任务接到编排器上。
//! 队列是至少一次投递，所以每个处理器对同一任务ID都是幂等的。
//!
//! 沙箱只在所属Worker上存在。本地找不到而归属记录指向另一个存活的Worker时，
//! 执行与删除都返回错误让任务重新投递，不会把别处的沙箱当作已删除。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use vmfleet_core::models::{task_types, CommandRequest, SandboxConfig, SandboxStatus, Task};
use vmfleet_core::traits::{TaskContext, TaskHandler};
use vmfleet_dispatcher::TaskQueue;
use vmfleet_errors::{FleetError, FleetResult};

use crate::orchestrator::SandboxOrchestrator;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSandboxPayload {
    /// 省略时使用任务ID
    #[serde(default)]
    pub sandbox_id: Option<String>,
    #[serde(default)]
    pub config: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteCommandPayload {
    pub sandbox_id: String,
    #[serde(flatten)]
    pub request: CommandRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteSandboxPayload {
    pub sandbox_id: String,
}

pub struct SandboxCreateHandler {
    orchestrator: Arc<SandboxOrchestrator>,
}

impl SandboxCreateHandler {
    pub fn new(orchestrator: Arc<SandboxOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl TaskHandler for SandboxCreateHandler {
    async fn handle(&self, task: &Task, ctx: &TaskContext) -> FleetResult<serde_json::Value> {
        let payload: CreateSandboxPayload = task.parse_payload()?;
        let sandbox_id = payload.sandbox_id.unwrap_or_else(|| task.id.clone());

        // 上一次投递留下的失败记录不能复活，重新投递时换一个全新的实例
        if ctx.is_redelivery() {
            if let Some(previous) = self.orchestrator.get_sandbox(&sandbox_id).await {
                if previous.status == SandboxStatus::Failed {
                    info!(
                        sandbox_id = %sandbox_id,
                        delivery = ctx.delivery,
                        "上次创建失败，重新创建沙箱"
                    );
                    self.orchestrator.forget_terminated(&sandbox_id).await?;
                }
            }
        }

        let sandbox = self
            .orchestrator
            .create_sandbox(&sandbox_id, payload.config)
            .await?;
        Ok(serde_json::json!({
            "sandbox_id": sandbox.id,
            "worker_id": sandbox.worker_id,
            "status": sandbox.status,
            "ready": sandbox.ready,
        }))
    }
}

pub struct SandboxExecuteHandler {
    orchestrator: Arc<SandboxOrchestrator>,
}

impl SandboxExecuteHandler {
    pub fn new(orchestrator: Arc<SandboxOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl TaskHandler for SandboxExecuteHandler {
    async fn handle(&self, task: &Task, _ctx: &TaskContext) -> FleetResult<serde_json::Value> {
        let payload: ExecuteCommandPayload = task.parse_payload()?;
        let output = match self
            .orchestrator
            .execute_command(&payload.sandbox_id, payload.request)
            .await
        {
            Ok(output) => output,
            Err(e) if e.is_not_found() => {
                return Err(owned_elsewhere(&self.orchestrator, &payload.sandbox_id)
                    .await
                    .unwrap_or(e))
            }
            Err(e) => return Err(e),
        };
        Ok(serde_json::json!({
            "sandbox_id": payload.sandbox_id,
            "output": output,
        }))
    }
}

pub struct SandboxDeleteHandler {
    orchestrator: Arc<SandboxOrchestrator>,
}

impl SandboxDeleteHandler {
    pub fn new(orchestrator: Arc<SandboxOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl TaskHandler for SandboxDeleteHandler {
    async fn handle(&self, task: &Task, _ctx: &TaskContext) -> FleetResult<serde_json::Value> {
        let payload: DeleteSandboxPayload = task.parse_payload()?;
        match self.orchestrator.delete_sandbox(&payload.sandbox_id).await {
            Ok(sandbox) => Ok(serde_json::json!({
                "sandbox_id": sandbox.id,
                "status": sandbox.status,
                "deleted": true,
            })),
            Err(e) if e.is_not_found() => {
                if let Some(misrouted) =
                    owned_elsewhere(&self.orchestrator, &payload.sandbox_id).await
                {
                    return Err(misrouted);
                }
                warn!(sandbox_id = %payload.sandbox_id, "要删除的沙箱不存在");
                Ok(serde_json::json!({
                    "sandbox_id": payload.sandbox_id,
                    "deleted": false,
                }))
            }
            Err(e) => Err(e),
        }
    }
}

async fn owned_elsewhere(orchestrator: &SandboxOrchestrator, sandbox_id: &str) -> Option<FleetError> {
    let owner = orchestrator.owner_elsewhere(sandbox_id).await?;
    warn!(sandbox_id, owner = %owner, worker_id = %orchestrator.worker_id(), "沙箱任务投递到了错误的Worker");
    Some(FleetError::InvalidState(format!(
        "沙箱 {sandbox_id} 属于Worker {owner}"
    )))
}

/// 向队列注册三类沙箱任务的处理器
pub async fn register_sandbox_handlers(
    queue: &TaskQueue,
    orchestrator: Arc<SandboxOrchestrator>,
) -> FleetResult<()> {
    queue
        .register_handler(
            task_types::SANDBOX_CREATE,
            Arc::new(SandboxCreateHandler::new(orchestrator.clone())),
        )
        .await?;
    queue
        .register_handler(
            task_types::SANDBOX_EXECUTE,
            Arc::new(SandboxExecuteHandler::new(orchestrator.clone())),
        )
        .await?;
    queue
        .register_handler(
            task_types::SANDBOX_DELETE,
            Arc::new(SandboxDeleteHandler::new(orchestrator)),
        )
        .await?;
    Ok(())
}
