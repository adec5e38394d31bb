//! # taskqueue-core
//!
//! 优先级感知任务队列的核心抽象：数据模型、纯状态机、老化评分、重试策略、
//! 存储与服务接口，以及配置模型。
//!
//! 本crate不包含任何I/O。存储实现位于 `taskqueue-infrastructure`，
//! 认领协议和恢复扫描位于 `taskqueue-dispatcher`。

pub mod config;
pub mod errors;
pub mod models;
pub mod scoring;
pub mod traits;

pub use errors::SchedulerError;
pub use scoring::ScoreFunction;

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
