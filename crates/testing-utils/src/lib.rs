//! # vmfleet Testing Utils
//!
//! 各crate共享的测试工具：
//!
//! - **Builders**: 带合理默认值的测试数据构建器
//! - **Mocks**: 可编排行为的沙箱后端、任务处理器和事件处理器
//! - **Helpers**: 异步条件等待等通用辅助函数
//!
//! ```toml
//! [dev-dependencies]
//! vmfleet-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
