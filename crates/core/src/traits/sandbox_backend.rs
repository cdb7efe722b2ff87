use async_trait::async_trait;

use crate::models::{BackendHandle, CommandOutput, CommandRequest, SandboxSpec};
use crate::FleetResult;

/// 虚拟化后端提供者
///
/// 网桥、NAT和镜像构建等前置条件由外部准备；编排器只通过此接口
/// 创建、启动、探活、执行命令和销毁实例。
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// 后端名称，对应Worker的能力集合
    fn name(&self) -> &str;

    /// 分配后端资源（网络接口、块设备、命令通道）
    async fn create(&self, spec: &SandboxSpec) -> FleetResult<BackendHandle>;

    async fn boot(&self, handle: &BackendHandle) -> FleetResult<()>;

    /// 命令通道存活探测
    async fn probe(&self, handle: &BackendHandle) -> FleetResult<()>;

    /// 通过隔离的命令通道执行命令，超时由调用方控制
    async fn command(
        &self,
        handle: &BackendHandle,
        request: &CommandRequest,
    ) -> FleetResult<CommandOutput>;

    /// 释放实例，对不存在的实例也应成功
    async fn destroy(&self, handle: &BackendHandle) -> FleetResult<()>;

    /// 后端当前持有的实例，用于启动对账
    async fn list(&self) -> FleetResult<Vec<BackendHandle>>;
}
