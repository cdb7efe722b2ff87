use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ResourceRequest;

/// 沙箱状态
///
/// `Created -> Starting -> Running -> Stopping -> Stopped`，
/// 任何非终止状态都可以进入 `Failed`。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SandboxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxStatus::Stopped | SandboxStatus::Failed)
    }

    pub fn can_transition_to(&self, next: SandboxStatus) -> bool {
        use SandboxStatus::*;
        match (self, next) {
            (Created, Starting) => true,
            (Starting, Running) => true,
            (Running, Stopping) => true,
            (Stopping, Stopped) => true,
            (current, Failed) => !current.is_terminal(),
            _ => false,
        }
    }

    /// 该状态是否占用Worker资源
    pub fn holds_resources(&self) -> bool {
        matches!(
            self,
            SandboxStatus::Starting | SandboxStatus::Running | SandboxStatus::Stopping
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Created => "created",
            SandboxStatus::Starting => "starting",
            SandboxStatus::Running => "running",
            SandboxStatus::Stopping => "stopping",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 需要安装的工具，可指定版本
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ToolRequest {
    pub name: String,
    pub version: Option<String>,
}

impl ToolRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn pinned(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
        }
    }

    /// 解析 `name` 或 `name@version` 形式
    pub fn parse(spec: &str) -> Self {
        match spec.split_once('@') {
            Some((name, version)) if !version.is_empty() => Self::pinned(name, version),
            _ => Self::new(spec.trim_end_matches('@')),
        }
    }
}

/// 网络挂载参数，网桥本身由外部预先准备
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub bridge: String,
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
}

/// 沙箱配置，创建后不可变
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxConfig {
    pub vcpus: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_mb: u64,
    pub image: String,
    /// 额外工具，安装在默认工具之后
    #[serde(default)]
    pub tools: Vec<ToolRequest>,
    #[serde(default = "default_true")]
    pub include_default_tools: bool,
    #[serde(default)]
    pub network: Option<NetworkAttachment>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            vcpus: 1,
            memory_mb: 512,
            disk_mb: 0,
            image: "default".to_string(),
            tools: Vec::new(),
            include_default_tools: true,
            network: None,
            env: BTreeMap::new(),
        }
    }
}

impl SandboxConfig {
    pub fn resource_request(&self) -> ResourceRequest {
        ResourceRequest {
            cpu_cores: self.vcpus,
            memory_mb: self.memory_mb,
            disk_mb: self.disk_mb,
        }
    }
}

/// 后端实例句柄
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BackendHandle {
    pub sandbox_id: String,
    pub backend: String,
    /// 后端内部标识，例如进程目录或VM套接字路径
    pub instance: String,
}

/// 交给后端的创建参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxSpec {
    pub sandbox_id: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub image: String,
    pub network: Option<NetworkAttachment>,
    pub env: BTreeMap<String, String>,
}

impl SandboxSpec {
    pub fn from_config(sandbox_id: &str, config: &SandboxConfig) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            vcpus: config.vcpus,
            memory_mb: config.memory_mb,
            disk_mb: config.disk_mb,
            image: config.image.clone(),
            network: config.network.clone(),
            env: config.env.clone(),
        }
    }
}

/// 在沙箱内执行的命令
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, with = "duration_ms_opt")]
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    /// 通过 `sh -c` 执行一段脚本
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh", vec!["-c".to_string(), script.into()])
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 命令执行结果
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// 沙箱实例
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sandbox {
    pub id: String,
    pub worker_id: String,
    pub status: SandboxStatus,
    pub config: SandboxConfig,
    /// 引导完成后才可交给调用方
    pub ready: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub handle: Option<BackendHandle>,
}

impl Sandbox {
    pub fn new(id: impl Into<String>, worker_id: impl Into<String>, config: SandboxConfig) -> Self {
        Self {
            id: id.into(),
            worker_id: worker_id.into(),
            status: SandboxStatus::Created,
            config,
            ready: false,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            error: None,
            handle: None,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.status == SandboxStatus::Running && self.ready
    }
}

mod duration_ms_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SandboxStatus::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(Created.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
    }

    #[test]
    fn test_failed_reachable_from_non_terminal_only() {
        for status in [Created, Starting, Running, Stopping] {
            assert!(status.can_transition_to(Failed), "{status} -> failed");
        }
        assert!(!Stopped.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn test_no_resurrection() {
        assert!(!Failed.can_transition_to(Starting));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Starting));
        assert!(!Created.can_transition_to(Running));
    }

    #[test]
    fn test_tool_request_parse() {
        assert_eq!(ToolRequest::parse("git"), ToolRequest::new("git"));
        assert_eq!(ToolRequest::parse("bun@1.1.0"), ToolRequest::pinned("bun", "1.1.0"));
        assert_eq!(ToolRequest::parse("node@"), ToolRequest::new("node"));
    }

    #[test]
    fn test_command_request_timeout_serde() {
        let request = CommandRequest::shell("echo hi").with_timeout(Duration::from_millis(1500));
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["timeout"], 1500);

        let parsed: CommandRequest =
            serde_json::from_value(serde_json::json!({"command": "ls"})).unwrap();
        assert_eq!(parsed.timeout, None);
        assert!(parsed.args.is_empty());
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: SandboxConfig = serde_json::from_value(serde_json::json!({
            "vcpus": 2,
            "memory_mb": 1024,
            "image": "ubuntu-22.04"
        }))
        .unwrap();
        assert!(config.include_default_tools);
        assert_eq!(config.resource_request(), ResourceRequest::new(2, 1024));
    }
}
