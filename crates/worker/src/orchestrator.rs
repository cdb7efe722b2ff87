//! 沙箱编排器
//!
//! 每个Worker一个编排器，独占其沙箱的整个生命周期：
//!
//! ```text
//! create:  allocate → Created → Starting → (create, boot, probe) → Running → bootstrap → ready
//! delete:  Running → Stopping → (等待进行中的命令, destroy) → Stopped → release
//! 任何失败: → Failed → destroy → release
//! ```
//!
//! 资源在准入时通过注册表预留，进入 `Stopped` 或 `Failed` 时归还。
//! 预留或归还与对应的状态转换在同一个记账互斥区内完成，对账只会看到两者都已发生
//! 或都未发生的沙箱。
//! 启动时必须先调用 [`SandboxOrchestrator::reconcile`]，否则拒绝创建。
//!
//! 挂接 [`SandboxDirectory`] 后，创建时登记沙箱归属，记录被删除时注销归属。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use vmfleet_core::config::SandboxSettings;
use vmfleet_core::models::{
    topics, BackendHandle, CommandOutput, CommandRequest, ResourceRequest, ResourceUsage, Sandbox,
    SandboxConfig, SandboxSpec, SandboxStatus,
};
use vmfleet_core::traits::{EventBus, SandboxBackend};
use vmfleet_dispatcher::WorkerRegistry;
use vmfleet_errors::{FleetError, FleetResult};

use crate::bootstrap::BootstrapInstaller;
use crate::ownership::SandboxDirectory;

/// 编排器的超时参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub startup_timeout: Duration,
    pub probe_interval: Duration,
    /// 未指定超时的命令使用此值
    pub command_timeout: Duration,
}

impl From<&SandboxSettings> for OrchestratorSettings {
    fn from(settings: &SandboxSettings) -> Self {
        Self {
            startup_timeout: settings.startup_timeout(),
            probe_interval: settings.probe_interval(),
            command_timeout: settings.command_timeout(),
        }
    }
}

/// 启动对账结果
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ReconcileReport {
    pub orphans_destroyed: Vec<String>,
    /// 本Worker名下但本地已没有记录的归属
    pub stale_claims: Vec<String>,
    pub usage: ResourceUsage,
}

struct SandboxEntry {
    state: Mutex<Sandbox>,
    /// 每个沙箱同时只允许一个命令
    command_lock: Arc<Mutex<()>>,
}

impl SandboxEntry {
    fn new(sandbox: Sandbox) -> Self {
        Self {
            state: Mutex::new(sandbox),
            command_lock: Arc::new(Mutex::new(())),
        }
    }
}

pub struct SandboxOrchestrator {
    worker_id: String,
    backend: Arc<dyn SandboxBackend>,
    registry: Arc<WorkerRegistry>,
    event_bus: Arc<dyn EventBus>,
    installer: BootstrapInstaller,
    settings: OrchestratorSettings,
    sandboxes: RwLock<HashMap<String, Arc<SandboxEntry>>>,
    directory: Option<SandboxDirectory>,
    /// 资源记账与占用资源的状态转换
    accounting: Mutex<()>,
    reconciled: AtomicBool,
}

impl SandboxOrchestrator {
    pub fn new(
        worker_id: impl Into<String>,
        backend: Arc<dyn SandboxBackend>,
        registry: Arc<WorkerRegistry>,
        event_bus: Arc<dyn EventBus>,
        installer: BootstrapInstaller,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            backend,
            registry,
            event_bus,
            installer,
            settings,
            sandboxes: RwLock::new(HashMap::new()),
            directory: None,
            accounting: Mutex::new(()),
            reconciled: AtomicBool::new(false),
        }
    }

    pub fn with_directory(mut self, directory: SandboxDirectory) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn is_reconciled(&self) -> bool {
        self.reconciled.load(Ordering::SeqCst)
    }

    /// 启动对账
    ///
    /// 销毁后端中本地不认识的实例，并用本地仍占用资源的沙箱重新计算Worker的使用量。
    pub async fn reconcile(&self) -> FleetResult<ReconcileReport> {
        let instances = self.backend.list().await?;

        let (recorded, known, usage) = {
            let _accounting = self.accounting.lock().await;
            let entries: Vec<Arc<SandboxEntry>> =
                self.sandboxes.read().await.values().cloned().collect();
            let mut recorded = HashSet::new();
            let mut known = HashSet::new();
            let mut usage = ResourceUsage::default();
            for entry in entries {
                let sandbox = entry.state.lock().await;
                recorded.insert(sandbox.id.clone());
                if sandbox.status.is_terminal() {
                    continue;
                }
                known.insert(sandbox.id.clone());
                if sandbox.status.holds_resources() {
                    let request = sandbox.config.resource_request();
                    usage.cpu_cores += request.cpu_cores;
                    usage.memory_mb += request.memory_mb;
                    usage.disk_mb += request.disk_mb;
                    usage.running_sandboxes += 1;
                }
            }
            self.registry.reset_usage(&self.worker_id, usage).await?;
            (recorded, known, usage)
        };

        let mut stale_claims = Vec::new();
        if let Some(directory) = &self.directory {
            for owner in directory.owned_by(&self.worker_id).await? {
                if recorded.contains(&owner.sandbox_id) {
                    continue;
                }
                directory.release(&owner.sandbox_id, &self.worker_id).await?;
                stale_claims.push(owner.sandbox_id);
            }
        }

        let mut orphans_destroyed = Vec::new();
        for handle in instances {
            if known.contains(&handle.sandbox_id) {
                continue;
            }
            match self.backend.destroy(&handle).await {
                Ok(()) => {
                    warn!(sandbox_id = %handle.sandbox_id, "销毁遗留的沙箱实例");
                    orphans_destroyed.push(handle.sandbox_id);
                }
                Err(e) => {
                    error!(sandbox_id = %handle.sandbox_id, error = %e, "销毁遗留沙箱实例失败")
                }
            }
        }

        self.reconciled.store(true, Ordering::SeqCst);

        info!(
            worker_id = %self.worker_id,
            orphans = orphans_destroyed.len(),
            stale_claims = stale_claims.len(),
            running_sandboxes = usage.running_sandboxes,
            "沙箱对账完成"
        );
        Ok(ReconcileReport {
            orphans_destroyed,
            stale_claims,
            usage,
        })
    }

    /// 创建沙箱
    ///
    /// 同一ID已就绪时直接返回（重复投递）；仍在创建、引导或停止中返回 `Busy`；
    /// 已终止的ID返回 `AlreadyExists`，终止的沙箱不会被复活。
    pub async fn create_sandbox(&self, id: &str, config: SandboxConfig) -> FleetResult<Sandbox> {
        if !self.is_reconciled() {
            return Err(FleetError::InvalidState(
                "编排器尚未完成启动对账，拒绝创建沙箱".to_string(),
            ));
        }

        let entry = {
            let mut sandboxes = self.sandboxes.write().await;
            if let Some(existing) = sandboxes.get(id) {
                let sandbox = existing.state.lock().await.clone();
                return match sandbox.status {
                    SandboxStatus::Running if sandbox.ready => {
                        debug!(sandbox_id = %id, "沙箱已就绪，重复的创建请求直接返回");
                        Ok(sandbox)
                    }
                    SandboxStatus::Stopped | SandboxStatus::Failed => {
                        Err(FleetError::AlreadyExists {
                            kind: "沙箱",
                            id: id.to_string(),
                        })
                    }
                    _ => Err(FleetError::Busy {
                        sandbox_id: id.to_string(),
                    }),
                };
            }
            let entry = Arc::new(SandboxEntry::new(Sandbox::new(
                id,
                self.worker_id.clone(),
                config.clone(),
            )));
            sandboxes.insert(id.to_string(), entry.clone());
            entry
        };

        if let Some(directory) = &self.directory {
            match directory.claim(id, &self.worker_id).await {
                Ok(None) => {}
                Ok(Some(owner)) => {
                    self.sandboxes.write().await.remove(id);
                    warn!(sandbox_id = %id, owner = %owner, "沙箱已属于其他Worker");
                    return Err(FleetError::AlreadyExists {
                        kind: "沙箱",
                        id: id.to_string(),
                    });
                }
                Err(e) => {
                    self.sandboxes.write().await.remove(id);
                    return Err(e);
                }
            }
        }

        let request = config.resource_request();
        {
            let _accounting = self.accounting.lock().await;
            if let Err(e) = self.registry.allocate(&self.worker_id, &request).await {
                self.sandboxes.write().await.remove(id);
                self.release_claim(id).await;
                warn!(sandbox_id = %id, error = %e, "沙箱准入被拒绝");
                return Err(e);
            }
            self.transition(&entry, SandboxStatus::Starting).await?;
        }
        self.publish(
            topics::VM_STARTING,
            serde_json::json!({
                "sandbox_id": id,
                "worker_id": self.worker_id,
                "vcpus": config.vcpus,
                "memory_mb": config.memory_mb,
            }),
        )
        .await;

        match self.provision(&entry, id, &config).await {
            Ok(sandbox) => {
                metrics::counter!("vmfleet_sandboxes_created_total").increment(1);
                Ok(sandbox)
            }
            Err(e) => {
                self.fail(&entry, &request, &e).await;
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        entry: &SandboxEntry,
        id: &str,
        config: &SandboxConfig,
    ) -> FleetResult<Sandbox> {
        let handle = self.backend.create(&SandboxSpec::from_config(id, config)).await?;
        entry.state.lock().await.handle = Some(handle.clone());

        let startup = async {
            self.backend.boot(&handle).await?;
            self.wait_until_live(&handle).await
        };
        tokio::time::timeout(self.settings.startup_timeout, startup)
            .await
            .map_err(|_| {
                FleetError::Timeout(format!(
                    "沙箱 {id} 未能在 {}ms 内启动",
                    self.settings.startup_timeout.as_millis()
                ))
            })??;

        self.transition(entry, SandboxStatus::Running).await?;
        debug!(sandbox_id = %id, "沙箱已启动，开始引导");

        let tools = self
            .installer
            .run(self.backend.as_ref(), &handle, config)
            .await?;

        let sandbox = {
            let mut sandbox = entry.state.lock().await;
            sandbox.ready = true;
            sandbox.clone()
        };

        info!(sandbox_id = %id, worker_id = %self.worker_id, tools = ?tools, "沙箱已就绪");
        self.publish(
            topics::VM_READY,
            serde_json::json!({
                "sandbox_id": id,
                "worker_id": self.worker_id,
                "tools": tools,
            }),
        )
        .await;
        Ok(sandbox)
    }

    async fn wait_until_live(&self, handle: &BackendHandle) -> FleetResult<()> {
        loop {
            match self.backend.probe(handle).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(sandbox_id = %handle.sandbox_id, error = %e, "探活未通过");
                    tokio::time::sleep(self.settings.probe_interval).await;
                }
            }
        }
    }

    /// 销毁后端实例，标记失败并归还预留的资源
    async fn fail(&self, entry: &SandboxEntry, request: &ResourceRequest, cause: &FleetError) {
        let (id, handle) = {
            let mut sandbox = entry.state.lock().await;
            sandbox.ready = false;
            sandbox.error = Some(cause.to_string());
            (sandbox.id.clone(), sandbox.handle.take())
        };

        if let Some(handle) = handle {
            if let Err(e) = self.backend.destroy(&handle).await {
                error!(sandbox_id = %id, error = %e, "销毁失败沙箱的后端实例出错");
            }
        }

        {
            let _accounting = self.accounting.lock().await;
            let held = {
                let mut sandbox = entry.state.lock().await;
                let held = sandbox.status.holds_resources();
                if sandbox.status.can_transition_to(SandboxStatus::Failed) {
                    sandbox.status = SandboxStatus::Failed;
                }
                sandbox.stopped_at = Some(Utc::now());
                held
            };
            if held {
                if let Err(e) = self.registry.release(&self.worker_id, request).await {
                    error!(sandbox_id = %id, error = %e, "归还沙箱资源失败");
                }
            }
        }

        error!(sandbox_id = %id, error = %cause, "沙箱进入失败状态");
        metrics::counter!("vmfleet_sandboxes_failed_total").increment(1);
        self.publish(
            topics::VM_FAILED,
            serde_json::json!({
                "sandbox_id": id,
                "worker_id": self.worker_id,
                "error": cause.to_string(),
            }),
        )
        .await;
    }

    async fn transition(&self, entry: &SandboxEntry, next: SandboxStatus) -> FleetResult<Sandbox> {
        let mut sandbox = entry.state.lock().await;
        if !sandbox.status.can_transition_to(next) {
            return Err(FleetError::InvalidState(format!(
                "沙箱 {} 不能从 {} 转换到 {}",
                sandbox.id, sandbox.status, next
            )));
        }
        sandbox.status = next;
        match next {
            SandboxStatus::Running => sandbox.started_at = Some(Utc::now()),
            SandboxStatus::Stopped | SandboxStatus::Failed => {
                sandbox.stopped_at = Some(Utc::now())
            }
            _ => {}
        }
        Ok(sandbox.clone())
    }

    /// 在沙箱中执行命令
    ///
    /// 同一沙箱同时只允许一个命令，重叠的调用返回 `Busy`。超时返回 `Timeout`，
    /// 此时命令在后端可能仍在执行，锁在其真正结束后才释放。
    pub async fn execute_command(
        &self,
        id: &str,
        request: CommandRequest,
    ) -> FleetResult<CommandOutput> {
        let entry = self.entry(id).await?;
        let guard = entry
            .command_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| FleetError::Busy {
                sandbox_id: id.to_string(),
            })?;

        let handle = {
            let sandbox = entry.state.lock().await;
            if !sandbox.is_usable() {
                return Err(FleetError::InvalidState(format!(
                    "沙箱 {id} 当前状态为 {}，无法执行命令",
                    sandbox.status
                )));
            }
            sandbox
                .handle
                .clone()
                .ok_or_else(|| FleetError::InvalidState(format!("沙箱 {id} 没有后端实例")))?
        };

        let timeout = request.timeout.unwrap_or(self.settings.command_timeout);
        let command = request.command.clone();
        let request = CommandRequest {
            timeout: Some(timeout),
            ..request
        };

        let backend = self.backend.clone();
        let execution = tokio::spawn(async move {
            let _guard = guard;
            backend.command(&handle, &request).await
        });

        let output = match tokio::time::timeout(timeout, execution).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_error)) => {
                return Err(FleetError::Internal(format!(
                    "沙箱 {id} 的命令任务异常: {join_error}"
                )))
            }
            Err(_) => {
                warn!(sandbox_id = %id, command = %command, "命令执行超时，结果未知");
                return Err(FleetError::Timeout(format!(
                    "沙箱 {id} 中的命令 {command} 超过 {}ms",
                    timeout.as_millis()
                )));
            }
        };

        debug!(
            sandbox_id = %id,
            command = %command,
            exit_code = output.exit_code,
            duration_ms = output.duration_ms,
            "命令执行完成"
        );
        metrics::counter!("vmfleet_sandbox_commands_total").increment(1);
        self.publish(
            topics::VM_COMMAND_COMPLETED,
            serde_json::json!({
                "sandbox_id": id,
                "command": command,
                "exit_code": output.exit_code,
                "duration_ms": output.duration_ms,
            }),
        )
        .await;
        Ok(output)
    }

    /// 删除沙箱
    ///
    /// 已停止或已失败的沙箱直接返回；仍在创建或引导中返回 `Busy`。
    pub async fn delete_sandbox(&self, id: &str) -> FleetResult<Sandbox> {
        let entry = self.entry(id).await?;
        let (handle, request) = {
            let mut sandbox = entry.state.lock().await;
            match sandbox.status {
                SandboxStatus::Stopped | SandboxStatus::Failed => {
                    debug!(sandbox_id = %id, "沙箱已终止，删除请求忽略");
                    return Ok(sandbox.clone());
                }
                SandboxStatus::Running if sandbox.ready => {
                    sandbox.status = SandboxStatus::Stopping;
                    (sandbox.handle.clone(), sandbox.config.resource_request())
                }
                _ => {
                    return Err(FleetError::Busy {
                        sandbox_id: id.to_string(),
                    })
                }
            }
        };
        info!(sandbox_id = %id, "正在停止沙箱");

        let _command_guard =
            match tokio::time::timeout(self.settings.command_timeout, entry.command_lock.lock())
                .await
            {
                Ok(guard) => Some(guard),
                Err(_) => {
                    warn!(sandbox_id = %id, "等待进行中的命令超时，直接销毁实例");
                    None
                }
            };

        if let Some(handle) = &handle {
            if let Err(e) = self.backend.destroy(handle).await {
                self.fail(&entry, &request, &e).await;
                return Err(e);
            }
        }

        let sandbox = {
            let _accounting = self.accounting.lock().await;
            {
                let mut sandbox = entry.state.lock().await;
                sandbox.handle = None;
                sandbox.ready = false;
            }
            let sandbox = self.transition(&entry, SandboxStatus::Stopped).await?;
            if let Err(e) = self.registry.release(&self.worker_id, &request).await {
                error!(sandbox_id = %id, error = %e, "归还沙箱资源失败");
            }
            sandbox
        };

        info!(sandbox_id = %id, "沙箱已删除");
        metrics::counter!("vmfleet_sandboxes_deleted_total").increment(1);
        self.publish(
            topics::VM_DELETED,
            serde_json::json!({
                "sandbox_id": id,
                "worker_id": self.worker_id,
            }),
        )
        .await;
        Ok(sandbox)
    }

    pub async fn get_sandbox(&self, id: &str) -> Option<Sandbox> {
        let entry = self.entry(id).await.ok()?;
        let sandbox = entry.state.lock().await.clone();
        Some(sandbox)
    }

    pub async fn list_sandboxes(&self) -> Vec<Sandbox> {
        let entries: Vec<Arc<SandboxEntry>> =
            self.sandboxes.read().await.values().cloned().collect();
        let mut sandboxes = Vec::with_capacity(entries.len());
        for entry in entries {
            sandboxes.push(entry.state.lock().await.clone());
        }
        sandboxes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sandboxes
    }

    /// 删除终止时间早于 `older_than` 之前的记录，返回删除数量
    pub async fn prune_terminated(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(older_than.as_millis().min(i64::MAX as u128) as i64);
        let mut sandboxes = self.sandboxes.write().await;

        let mut expired = Vec::new();
        for (id, entry) in sandboxes.iter() {
            let sandbox = entry.state.lock().await;
            let terminated_before_cutoff = sandbox.status.is_terminal()
                && sandbox.stopped_at.map(|t| t <= cutoff).unwrap_or(true);
            if terminated_before_cutoff {
                expired.push(id.clone());
            }
        }
        for id in &expired {
            sandboxes.remove(id);
        }
        drop(sandboxes);
        for id in &expired {
            self.release_claim(id).await;
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "清理已终止的沙箱记录");
        }
        expired.len()
    }

    /// 删除单个已终止沙箱的记录，使同一ID可以重新创建新的实例
    pub async fn forget_terminated(&self, id: &str) -> FleetResult<bool> {
        let mut sandboxes = self.sandboxes.write().await;
        let Some(entry) = sandboxes.get(id) else {
            return Ok(false);
        };
        let status = entry.state.lock().await.status;
        if !status.is_terminal() {
            return Err(FleetError::InvalidState(format!(
                "沙箱 {id} 当前状态为 {status}，不能删除记录"
            )));
        }
        sandboxes.remove(id);
        drop(sandboxes);
        self.release_claim(id).await;
        Ok(true)
    }

    /// 沙箱归属于另一个存活的Worker时返回其ID
    pub async fn owner_elsewhere(&self, id: &str) -> Option<String> {
        let directory = self.directory.as_ref()?;
        match directory.live_owner(id).await {
            Ok(Some(owner)) if owner != self.worker_id => Some(owner),
            Ok(_) => None,
            Err(e) => {
                warn!(sandbox_id = %id, error = %e, "查询沙箱归属失败");
                None
            }
        }
    }

    async fn release_claim(&self, id: &str) {
        if let Some(directory) = &self.directory {
            if let Err(e) = directory.release(id, &self.worker_id).await {
                warn!(sandbox_id = %id, error = %e, "注销沙箱归属失败");
            }
        }
    }

    async fn entry(&self, id: &str) -> FleetResult<Arc<SandboxEntry>> {
        self.sandboxes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::sandbox_not_found(id))
    }

    async fn publish(&self, topic: &str, payload: serde_json::Value) {
        if let Err(e) = self.event_bus.publish(topic, payload).await {
            warn!(topic, error = %e, "发布沙箱事件失败");
        }
    }
}
