//! vmfleet 核心库：领域模型、组件接口、配置与日志初始化

pub mod config;
pub mod logging;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use vmfleet_errors::{FleetError, FleetResult};
