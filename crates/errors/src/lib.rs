use thiserror::Error;

#[cfg(test)]
mod tests;

/// 控制平面统一错误类型
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("{kind}未找到: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind}已存在: {id}")]
    AlreadyExists { kind: &'static str, id: String },
    #[error("任务类型 {task_type} 已注册处理器")]
    DuplicateHandler { task_type: String },
    #[error("资源不足: {0}")]
    CapacityExceeded(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("沙箱后端错误: {0}")]
    BackendFailure(String),
    #[error("工具 {tool} 安装失败: {reason}")]
    InstallFailed { tool: String, reason: String },
    #[error("沙箱引导超时: 已超过 {timeout_ms}ms")]
    BootstrapTimeout { timeout_ms: u64 },
    #[error("沙箱 {sandbox_id} 正忙")]
    Busy { sandbox_id: String },
    #[error("无效状态: {0}")]
    InvalidState(String),
    #[error("无效的资源快照: {0}")]
    InvalidResources(String),
    #[error("任务入队失败: {0}")]
    EnqueueError(String),
    #[error("存储错误: {0}")]
    Storage(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("本地资源耗尽: {0}")]
    ResourceExhausted(String),
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type FleetResult<T> = Result<T, FleetError>;

impl FleetError {
    pub fn worker_not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound {
            kind: "Worker",
            id: id.into(),
        }
    }
    pub fn sandbox_not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound {
            kind: "沙箱",
            id: id.into(),
        }
    }
    pub fn subscription_not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound {
            kind: "订阅",
            id: id.into(),
        }
    }
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound {
            kind: "任务",
            id: id.into(),
        }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn storage_error<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }
    pub fn backend_error<S: Into<String>>(msg: S) -> Self {
        Self::BackendFailure(msg.into())
    }
    pub fn is_not_found(&self) -> bool {
        matches!(self, FleetError::NotFound { .. })
    }
    /// 本地不可恢复的错误，直接向上传播，不做重试
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FleetError::Internal(_)
                | FleetError::Configuration(_)
                | FleetError::ResourceExhausted(_)
        )
    }
    /// 调用方可以安全重试的瞬时错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::Storage(_)
                | FleetError::EnqueueError(_)
                | FleetError::Timeout(_)
                | FleetError::Busy { .. }
                | FleetError::CapacityExceeded(_)
        )
    }
    /// 超时意味着结果未知，调用方需要通过状态查询来对账
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(
            self,
            FleetError::Timeout(_) | FleetError::BootstrapTimeout { .. }
        )
    }
    pub fn user_message(&self) -> &str {
        match self {
            FleetError::NotFound { .. } => "请求的资源不存在",
            FleetError::AlreadyExists { .. } => "资源已存在",
            FleetError::CapacityExceeded(_) => "集群容量不足，请稍后重试",
            FleetError::Busy { .. } => "沙箱正在执行其他命令，请稍后重试",
            FleetError::Timeout(_) | FleetError::BootstrapTimeout { .. } => {
                "操作超时，结果未知，请查询状态后重试"
            }
            FleetError::InstallFailed { .. } => "沙箱工具安装失败",
            FleetError::BackendFailure(_) => "沙箱后端故障",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for FleetError {
    fn from(err: anyhow::Error) -> Self {
        FleetError::Internal(err.to_string())
    }
}
