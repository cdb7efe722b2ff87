use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vmfleet_core::config::RedisConfig;
use vmfleet_core::traits::{RegistryStore, StoreChange};
use vmfleet_errors::FleetResult;

use super::WATCH_CAPACITY;
use crate::redis_support::{self, redis_error, KeySpace};

const SCAN_COUNT: usize = 200;

/// Redis注册表存储
///
/// 数据键为 `{prefix}:registry:{key}`，TTL由Redis的PX过期实现。
/// 写入和删除会发布到 `{prefix}:registry:changes` 频道，供其他进程监听。
pub struct RedisRegistryStore {
    client: redis::Client,
    conn: ConnectionManager,
    keys: KeySpace,
    changes: broadcast::Sender<StoreChange>,
    listener: Mutex<Option<CancellationToken>>,
}

impl RedisRegistryStore {
    pub async fn new(config: &RedisConfig) -> FleetResult<Self> {
        let (client, conn) = redis_support::connect(config).await?;
        let (changes, _) = broadcast::channel(WATCH_CAPACITY);
        info!("Redis注册表存储已连接，前缀: {}", config.key_prefix);
        Ok(Self {
            client,
            conn,
            keys: KeySpace::new(config.key_prefix.clone()),
            changes,
            listener: Mutex::new(None),
        })
    }

    fn data_key(&self, key: &str) -> String {
        self.keys.key(&format!("registry:{key}"))
    }

    fn changes_channel(&self) -> String {
        self.keys.key("registry:changes")
    }

    async fn announce(&self, change: &StoreChange) {
        let body = match serde_json::to_string(change) {
            Ok(body) => body,
            Err(e) => {
                warn!("序列化注册表变更失败: {}", e);
                return;
            }
        };
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = redis::cmd("PUBLISH")
            .arg(self.changes_channel())
            .arg(body)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!("发布注册表变更 {} 失败: {}", change.key(), e);
        }
    }

    async fn ensure_listener(&self) -> FleetResult<()> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }

        let mut pubsub = self.client.get_async_pubsub().await.map_err(redis_error)?;
        let channel = self.changes_channel();
        pubsub.subscribe(&channel).await.map_err(redis_error)?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let sender = self.changes.clone();
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    message = messages.next() => {
                        let Some(message) = message else {
                            warn!("注册表变更频道 {} 的连接已断开", channel);
                            break;
                        };
                        let payload: String = match message.get_payload() {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!("读取注册表变更失败: {}", e);
                                continue;
                            }
                        };
                        match serde_json::from_str::<StoreChange>(&payload) {
                            Ok(change) => {
                                let _ = sender.send(change);
                            }
                            Err(e) => warn!("无法解析注册表变更: {}", e),
                        }
                    }
                }
            }
            debug!("注册表变更监听任务退出");
        });

        *listener = Some(cancel);
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for RedisRegistryStore {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> FleetResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.data_key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }

        let mut conn = self.conn.clone();
        let _: () = cmd.query_async(&mut conn).await.map_err(redis_error)?;

        self.announce(&StoreChange::Put {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await;
        Ok(())
    }

    async fn get(&self, key: &str) -> FleetResult<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(self.data_key(key))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)
    }

    async fn delete(&self, key: &str) -> FleetResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.data_key(key))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        if removed > 0 {
            self.announce(&StoreChange::Deleted {
                key: key.to_string(),
            })
            .await;
        }
        Ok(removed > 0)
    }

    async fn list(&self, prefix: &str) -> FleetResult<Vec<(String, String)>> {
        let full_prefix = self.data_key(prefix);
        let pattern = format!("{full_prefix}*");
        let strip = self.data_key("");

        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        found.sort();
        found.dedup();
        if found.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&found)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        Ok(found
            .into_iter()
            .zip(values)
            .filter_map(|(full_key, value)| {
                let value = value?;
                let key = full_key.strip_prefix(&strip)?.to_string();
                Some((key, value))
            })
            .collect())
    }

    async fn watch(&self) -> FleetResult<broadcast::Receiver<StoreChange>> {
        let receiver = self.changes.subscribe();
        self.ensure_listener().await?;
        Ok(receiver)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

impl Drop for RedisRegistryStore {
    fn drop(&mut self) {
        if let Some(cancel) = self.listener.get_mut().take() {
            cancel.cancel();
        }
    }
}
