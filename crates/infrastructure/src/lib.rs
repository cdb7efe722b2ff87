//! 可插拔后端：事件总线、分发队列存储和注册表存储
//!
//! 每种后端都有内存实现（单进程、测试）和Redis实现（多进程部署）。
//! 进程启动时通过 [`BackendFactory`] 按配置一次性选定。

pub mod event_bus;
pub mod factory;
pub mod queue_store;
pub mod redis_support;
pub mod registry_store;

pub use event_bus::{InMemoryEventBus, RedisEventBus};
pub use factory::{BackendFactory, Backends};
pub use queue_store::{InMemoryQueueStore, RedisQueueStore};
pub use registry_store::{InMemoryRegistryStore, RedisRegistryStore};
