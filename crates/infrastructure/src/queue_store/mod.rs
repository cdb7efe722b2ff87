//! 分发队列存储实现

pub mod memory;
pub mod redis_queue;
mod scripts;

pub use memory::InMemoryQueueStore;
pub use redis_queue::RedisQueueStore;
