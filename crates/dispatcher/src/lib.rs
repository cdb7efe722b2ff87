//! 控制平面调度组件
//!
//! - [`registry`]：Worker成员关系与资源记账
//! - [`expiry_sweeper`]：心跳超时Worker的后台清理
//! - [`queue`]：至少一次投递的分层任务队列
//! - [`retry`]：重新投递的退避策略

pub mod expiry_sweeper;
pub mod queue;
pub mod registry;
pub mod retry;

pub use expiry_sweeper::ExpirySweeper;
pub use queue::TaskQueue;
pub use registry::{WorkerRegistry, WorkerWatcher, WORKER_KEY_PREFIX};
pub use retry::RetryPolicy;
