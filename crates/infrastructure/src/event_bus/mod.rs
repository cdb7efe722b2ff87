//! 事件总线实现
//!
//! 两种实现共享同一个本地扇出结构：每个订阅者拥有独立的无界通道和投递任务，
//! 因此慢订阅者不会阻塞发布者，同一订阅者按发布顺序收到事件。

mod fanout;
pub mod memory;
pub mod redis_bus;

pub use memory::InMemoryEventBus;
pub use redis_bus::RedisEventBus;
