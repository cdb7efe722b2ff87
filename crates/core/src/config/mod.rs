//! 配置管理
//!
//! 配置按以下顺序叠加：内置默认值、TOML配置文件、`VMFLEET_` 前缀的环境变量。
//! 嵌套字段用双下划线分隔，例如 `VMFLEET_BACKEND__KIND=redis`。
//! 加载完成后统一调用 [`AppConfig::validate`]。

pub mod models;

pub use models::*;

#[cfg(test)]
mod config_test;
