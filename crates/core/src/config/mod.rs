//! 配置管理
//!
//! 配置按职责拆分为若干段：存储、队列、重试、恢复、Worker、可观测性。
//! 加载顺序为内置默认值、TOML文件、`TASKQUEUE__` 前缀的环境变量，
//! 每一段都有自己的 `validate()`，加载后整体校验。

pub mod models;

pub use models::*;

#[cfg(test)]
mod tests;
