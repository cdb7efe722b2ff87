use std::sync::Arc;

use tracing::info;
use vmfleet_core::config::{BackendConfig, BackendKind};
use vmfleet_core::traits::{EventBus, QueueStore, RegistryStore};
use vmfleet_errors::FleetResult;

use crate::{
    InMemoryEventBus, InMemoryQueueStore, InMemoryRegistryStore, RedisEventBus, RedisQueueStore,
    RedisRegistryStore,
};

/// 一组同类型的后端，进程内共享
#[derive(Clone)]
pub struct Backends {
    pub event_bus: Arc<dyn EventBus>,
    pub queue_store: Arc<dyn QueueStore>,
    pub registry_store: Arc<dyn RegistryStore>,
}

impl Backends {
    pub fn kind(&self) -> &'static str {
        self.queue_store.backend_name()
    }
}

pub struct BackendFactory;

impl BackendFactory {
    pub async fn create(config: &BackendConfig) -> FleetResult<Backends> {
        info!("初始化 {} 后端", config.kind.as_str());

        match config.kind {
            BackendKind::Memory => Ok(Self::in_memory()),
            BackendKind::Redis => {
                let event_bus = RedisEventBus::new(&config.redis).await?;
                let queue_store = RedisQueueStore::new(&config.redis).await?;
                let registry_store = RedisRegistryStore::new(&config.redis).await?;
                Ok(Backends {
                    event_bus: Arc::new(event_bus),
                    queue_store: Arc::new(queue_store),
                    registry_store: Arc::new(registry_store),
                })
            }
        }
    }

    pub fn in_memory() -> Backends {
        Backends {
            event_bus: Arc::new(InMemoryEventBus::new()),
            queue_store: Arc::new(InMemoryQueueStore::new()),
            registry_store: Arc::new(InMemoryRegistryStore::new()),
        }
    }
}
