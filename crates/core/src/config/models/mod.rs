pub mod app_config;
pub mod backend;
pub mod observability;
pub mod registry_queue;
pub mod worker_sandbox;

pub use app_config::{AppConfig, ENV_PREFIX};
pub use backend::{BackendConfig, BackendKind, RedisConfig};
pub use observability::ObservabilityConfig;
pub use registry_queue::{QueueConfig, RegistryConfig, RetryConfig};
pub use worker_sandbox::{SandboxSettings, ToolRecipeConfig, WorkerConfig};
