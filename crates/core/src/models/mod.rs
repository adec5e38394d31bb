//! # 数据模型
//!
//! 任务队列的核心数据结构：任务登记记录、Worker信息、优先级索引条目，
//! 以及纯函数式的状态机和重试策略。
//!
//! 所有时间字段使用 `DateTime<Utc>`，状态字段使用枚举类型，
//! 所有模型都实现了序列化，便于持久化存储和观测输出。

pub mod queue;
pub mod retry;
pub mod stats;
pub mod task;
pub mod transition;
pub mod worker;

pub use queue::*;
pub use retry::*;
pub use stats::*;
pub use task::*;
pub use transition::*;
pub use worker::*;
