//! 沙箱归属
//!
//! 沙箱实例只存在于创建它的Worker上。创建时在注册存储的 `sandboxes/<id>` 下登记归属，
//! [`SandboxTaskRouter`] 据此把执行与删除任务定向给所属Worker。
//! 所属Worker的注册记录已过期时视为没有归属，任务按公共任务投递。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use vmfleet_core::models::{task_types, Task};
use vmfleet_core::traits::{RegistryStore, TaskRouter};
use vmfleet_dispatcher::WORKER_KEY_PREFIX;
use vmfleet_errors::{FleetError, FleetResult};

pub const SANDBOX_KEY_PREFIX: &str = "sandboxes/";

fn sandbox_key(id: &str) -> String {
    format!("{SANDBOX_KEY_PREFIX}{id}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxOwner {
    pub sandbox_id: String,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// 注册存储中的沙箱归属记录
#[derive(Clone)]
pub struct SandboxDirectory {
    store: Arc<dyn RegistryStore>,
}

impl SandboxDirectory {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    pub async fn owner(&self, sandbox_id: &str) -> FleetResult<Option<SandboxOwner>> {
        match self.store.get(&sandbox_key(sandbox_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// 所属Worker仍在注册表中时返回其ID
    pub async fn live_owner(&self, sandbox_id: &str) -> FleetResult<Option<String>> {
        let Some(owner) = self.owner(sandbox_id).await? else {
            return Ok(None);
        };
        if self.is_alive(&owner.worker_id).await? {
            Ok(Some(owner.worker_id))
        } else {
            debug!(sandbox_id, worker_id = %owner.worker_id, "沙箱所属Worker已不在注册表中");
            Ok(None)
        }
    }

    pub async fn is_alive(&self, worker_id: &str) -> FleetResult<bool> {
        Ok(self
            .store
            .get(&format!("{WORKER_KEY_PREFIX}{worker_id}"))
            .await?
            .is_some())
    }

    /// 登记 `worker_id` 为沙箱的所属Worker
    ///
    /// 沙箱已属于另一个存活的Worker时不覆盖，返回 `Ok(Some(那个Worker))`。
    /// 读取与写入不是原子的，同一ID在两个Worker上并发创建时以后写入者为准。
    pub async fn claim(&self, sandbox_id: &str, worker_id: &str) -> FleetResult<Option<String>> {
        if let Some(owner) = self.live_owner(sandbox_id).await? {
            if owner != worker_id {
                return Ok(Some(owner));
            }
        }
        let record = SandboxOwner {
            sandbox_id: sandbox_id.to_string(),
            worker_id: worker_id.to_string(),
            claimed_at: Utc::now(),
        };
        self.store
            .put(&sandbox_key(sandbox_id), &serde_json::to_string(&record)?, None)
            .await?;
        Ok(None)
    }

    /// 删除归属记录，只删除属于 `worker_id` 的记录
    pub async fn release(&self, sandbox_id: &str, worker_id: &str) -> FleetResult<bool> {
        match self.owner(sandbox_id).await? {
            Some(owner) if owner.worker_id == worker_id => {
                self.store.delete(&sandbox_key(sandbox_id)).await
            }
            _ => Ok(false),
        }
    }

    pub async fn owned_by(&self, worker_id: &str) -> FleetResult<Vec<SandboxOwner>> {
        let mut owned = Vec::new();
        for (key, raw) in self.store.list(SANDBOX_KEY_PREFIX).await? {
            match serde_json::from_str::<SandboxOwner>(&raw) {
                Ok(owner) if owner.worker_id == worker_id => owned.push(owner),
                Ok(_) => {}
                Err(e) => warn!(key = %key, error = %e, "无法解析沙箱归属记录"),
            }
        }
        owned.sort_by(|a, b| a.sandbox_id.cmp(&b.sandbox_id));
        Ok(owned)
    }
}

/// 按沙箱归属定向沙箱任务
pub struct SandboxTaskRouter {
    directory: SandboxDirectory,
}

impl SandboxTaskRouter {
    pub fn new(directory: SandboxDirectory) -> Self {
        Self { directory }
    }

    fn sandbox_id(task: &Task) -> FleetResult<Option<String>> {
        let field = task.payload.get("sandbox_id").and_then(|v| v.as_str());
        match task.task_type.as_str() {
            task_types::SANDBOX_CREATE => {
                Ok(Some(field.map(str::to_string).unwrap_or_else(|| task.id.clone())))
            }
            task_types::SANDBOX_EXECUTE | task_types::SANDBOX_DELETE => field
                .map(|id| Some(id.to_string()))
                .ok_or_else(|| {
                    FleetError::TaskExecution(format!("任务 {} 缺少 sandbox_id", task.id))
                }),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl TaskRouter for SandboxTaskRouter {
    async fn route(&self, task: &Task) -> FleetResult<Option<String>> {
        match Self::sandbox_id(task)? {
            Some(sandbox_id) => self.directory.live_owner(&sandbox_id).await,
            None => Ok(None),
        }
    }
}
