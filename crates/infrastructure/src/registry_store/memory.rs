use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use vmfleet_core::traits::{RegistryStore, StoreChange};
use vmfleet_errors::FleetResult;

use super::WATCH_CAPACITY;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|t| t > now).unwrap_or(true)
    }
}

/// 内存注册表存储，TTL惰性过期
pub struct InMemoryRegistryStore {
    entries: RwLock<HashMap<String, Entry>>,
    changes: broadcast::Sender<StoreChange>,
}

impl InMemoryRegistryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            changes,
        }
    }

    fn notify(&self, change: StoreChange) {
        // 没有监听者时发送失败，忽略
        let _ = self.changes.send(change);
    }
}

impl Default for InMemoryRegistryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryStore for InMemoryRegistryStore {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> FleetResult<()> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.write().await.insert(key.to_string(), entry);
        self.notify(StoreChange::Put {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> FleetResult<Option<String>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        let mut entries = self.entries.write().await;
        if entries.get(key).map(|e| !e.is_live(now)).unwrap_or(false) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> FleetResult<bool> {
        let now = Instant::now();
        let removed = self.entries.write().await.remove(key);
        let existed = removed.map(|e| e.is_live(now)).unwrap_or(false);
        if existed {
            self.notify(StoreChange::Deleted {
                key: key.to_string(),
            });
        }
        Ok(existed)
    }

    async fn list(&self, prefix: &str) -> FleetResult<Vec<(String, String)>> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.is_live(now));
        let mut items: Vec<(String, String)> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(items)
    }

    async fn watch(&self) -> FleetResult<broadcast::Receiver<StoreChange>> {
        Ok(self.changes.subscribe())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryRegistryStore::new();
        store.put("workers/w1", "{}", None).await.unwrap();
        assert_eq!(store.get("workers/w1").await.unwrap().as_deref(), Some("{}"));

        assert!(store.delete("workers/w1").await.unwrap());
        assert!(!store.delete("workers/w1").await.unwrap());
        assert!(store.get("workers/w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_lazy() {
        let store = InMemoryRegistryStore::new();
        store
            .put("workers/short", "a", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        store.put("workers/long", "b", None).await.unwrap();
        store.put("other/x", "c", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("workers/short").await.unwrap().is_none());

        let listed = store.list("workers/").await.unwrap();
        assert_eq!(listed, vec![("workers/long".to_string(), "b".to_string())]);
    }

    #[tokio::test]
    async fn test_watch_receives_changes() {
        let store = InMemoryRegistryStore::new();
        let mut rx = store.watch().await.unwrap();

        store.put("workers/w1", "v1", None).await.unwrap();
        store.delete("workers/w1").await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            StoreChange::Put {
                key: "workers/w1".to_string(),
                value: "v1".to_string()
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            StoreChange::Deleted {
                key: "workers/w1".to_string()
            }
        );
    }
}
