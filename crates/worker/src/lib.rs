//! Worker节点组件
//!
//! - [`backend`]：沙箱后端的选择与本地进程后端
//! - [`bootstrap`]：工具配方目录与引导安装
//! - [`orchestrator`]：沙箱生命周期与资源记账
//! - [`handlers`]：沙箱任务处理器
//! - [`ownership`]：沙箱归属登记与任务定向
//! - [`service`]：注册、心跳与队列消费的组装

pub mod backend;
pub mod bootstrap;
pub mod handlers;
pub mod orchestrator;
pub mod ownership;
pub mod service;

pub use backend::{create_backend, LocalProcessBackend};
pub use bootstrap::{BootstrapInstaller, ToolCatalog, ToolRecipe};
pub use handlers::{
    register_sandbox_handlers, SandboxCreateHandler, SandboxDeleteHandler, SandboxExecuteHandler,
};
pub use orchestrator::{OrchestratorSettings, ReconcileReport, SandboxOrchestrator};
pub use ownership::{SandboxDirectory, SandboxOwner, SandboxTaskRouter, SANDBOX_KEY_PREFIX};
pub use service::{WorkerService, WorkerServiceBuilder};
