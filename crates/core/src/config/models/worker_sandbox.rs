use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{ResourceCapacity, WorkerRegistration};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub worker_id: String,
    pub hostname: String,
    pub address: String,
    pub zone: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub max_sandboxes: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: "worker-001".to_string(),
            hostname: "localhost".to_string(),
            address: "127.0.0.1".to_string(),
            zone: "default".to_string(),
            labels: BTreeMap::new(),
            cpu_cores: 4,
            memory_mb: 8192,
            disk_mb: 51_200,
            max_sandboxes: 8,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            return Err(anyhow::anyhow!("Worker ID不能为空"));
        }

        if self.hostname.is_empty() {
            return Err(anyhow::anyhow!("主机名不能为空"));
        }

        if self.address.is_empty() {
            return Err(anyhow::anyhow!("网络地址不能为空"));
        }

        if self.cpu_cores == 0 {
            return Err(anyhow::anyhow!("CPU核数必须大于0"));
        }

        if self.memory_mb == 0 {
            return Err(anyhow::anyhow!("内存容量必须大于0"));
        }

        if self.max_sandboxes == 0 {
            return Err(anyhow::anyhow!("最大沙箱数必须大于0"));
        }

        Ok(())
    }

    pub fn capacity(&self) -> ResourceCapacity {
        ResourceCapacity {
            cpu_cores: self.cpu_cores,
            memory_mb: self.memory_mb,
            disk_mb: self.disk_mb,
            max_sandboxes: self.max_sandboxes,
        }
    }

    /// 生成注册请求，能力集合由实际启用的沙箱后端决定
    pub fn registration(&self, capabilities: BTreeSet<String>) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: self.worker_id.clone(),
            hostname: self.hostname.clone(),
            address: self.address.clone(),
            zone: self.zone.clone(),
            labels: self.labels.clone(),
            capabilities,
            capacity: self.capacity(),
        }
    }
}

/// 工具安装配方，脚本中的 `{version}` 会被替换为版本号
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolRecipeConfig {
    pub install: String,
    pub verify: String,
    pub default_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// 启用的沙箱后端
    pub backend: String,
    /// 本地进程后端的沙箱根目录
    pub workdir_root: String,
    pub startup_timeout_seconds: u64,
    pub probe_interval_ms: u64,
    pub command_timeout_seconds: u64,
    pub bootstrap_timeout_seconds: u64,
    #[serde(default)]
    pub default_tools: Vec<String>,
    /// 额外或覆盖内置的工具配方
    #[serde(default)]
    pub tool_catalog: BTreeMap<String, ToolRecipeConfig>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            backend: "process".to_string(),
            workdir_root: "/var/lib/vmfleet/sandboxes".to_string(),
            startup_timeout_seconds: 30,
            probe_interval_ms: 200,
            command_timeout_seconds: 600,
            bootstrap_timeout_seconds: 300,
            default_tools: vec!["git".to_string(), "curl".to_string()],
            tool_catalog: BTreeMap::new(),
        }
    }
}

impl SandboxSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_backends = ["process"];
        if !valid_backends.contains(&self.backend.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的沙箱后端: {}，支持的后端: {:?}",
                self.backend,
                valid_backends
            ));
        }

        if self.workdir_root.is_empty() {
            return Err(anyhow::anyhow!("沙箱根目录不能为空"));
        }

        if self.startup_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("沙箱启动超时时间必须大于0"));
        }

        if self.probe_interval_ms == 0 {
            return Err(anyhow::anyhow!("探活间隔必须大于0"));
        }

        if self.command_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("命令超时时间必须大于0"));
        }

        if self.bootstrap_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("引导超时时间必须大于0"));
        }

        for (name, recipe) in &self.tool_catalog {
            if recipe.install.trim().is_empty() || recipe.verify.trim().is_empty() {
                return Err(anyhow::anyhow!("工具 {name} 的安装或校验命令不能为空"));
            }
        }

        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_seconds)
    }
}
