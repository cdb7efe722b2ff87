//! # 数据模型
//!
//! 控制平面的核心数据结构：Worker与资源快照、筛选条件、任务与投递约定、
//! 沙箱状态机以及事件。
//!
//! ## 状态流转
//!
//! ### 沙箱
//! ```text
//! Created → Starting → Running → Stopping → Stopped
//!    ↓         ↓          ↓          ↓
//!    └─────────┴──── Failed ─────────┘
//! ```
//!
//! ### Worker
//! ```text
//! Active ⇄ Draining
//!   ↓  (心跳超过阈值，惰性判定)
//! Offline
//! ```
//!
//! 所有时间字段使用 `DateTime<Utc>`，所有模型实现 `Serialize`/`Deserialize`，
//! 以便写入可插拔的存储后端。

pub mod event;
pub mod filter;
pub mod sandbox;
pub mod task;
pub mod worker;

pub use event::*;
pub use filter::*;
pub use sandbox::*;
pub use task::*;
pub use worker::*;
