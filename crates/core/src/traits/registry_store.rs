use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::FleetResult;

/// 存储变更通知
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreChange {
    Put { key: String, value: String },
    Deleted { key: String },
}

impl StoreChange {
    pub fn key(&self) -> &str {
        match self {
            StoreChange::Put { key, .. } | StoreChange::Deleted { key } => key,
        }
    }
}

/// Worker注册表的可插拔持久化存储
///
/// 键作用域读写，支持TTL过期和变更监听。TTL过期本身不保证产生变更通知，
/// 注册表依靠惰性过期和清理循环处理。
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> FleetResult<()>;

    async fn get(&self, key: &str) -> FleetResult<Option<String>>;

    /// 删除键，返回键是否存在
    async fn delete(&self, key: &str) -> FleetResult<bool>;

    /// 列出前缀下所有未过期的键值
    async fn list(&self, prefix: &str) -> FleetResult<Vec<(String, String)>>;

    /// 订阅变更
    async fn watch(&self) -> FleetResult<broadcast::Receiver<StoreChange>>;

    fn backend_name(&self) -> &'static str;
}
