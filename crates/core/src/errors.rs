use thiserror::Error;

use crate::models::TaskId;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("存储不可用: {0}")]
    StoreUnavailable(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: TaskId },

    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },

    #[error("Worker {id} 无法接收任务: {reason}")]
    WorkerUnavailable { id: String, reason: String },

    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),

    #[error("非法的状态转换: {0}")]
    InvalidTransition(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 后端存储（索引或登记表）不可达，调用方应进入降级模式
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_) | SchedulerError::StoreUnavailable(_)
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        SchedulerError::InvalidTaskParams(message.into())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, SchedulerError>;
