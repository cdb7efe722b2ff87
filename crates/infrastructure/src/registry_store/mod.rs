//! 注册表存储实现

pub mod memory;
pub mod redis_registry;

pub use memory::InMemoryRegistryStore;
pub use redis_registry::RedisRegistryStore;

/// 变更通知通道容量，落后超过此数量的监听者会收到 `Lagged`
pub(crate) const WATCH_CAPACITY: usize = 1024;
