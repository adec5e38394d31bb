use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use taskqueue_core::models::{Task, TaskOutcome};

/// 任务处理失败
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// 为 false 时任务直接进入死信队列
    pub retriable: bool,
}

impl HandlerError {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }
}

/// 处理结果转换为上报给调度器的结果
pub fn into_outcome(result: Result<Option<serde_json::Value>, HandlerError>) -> TaskOutcome {
    match result {
        Ok(output) => TaskOutcome::success(output),
        Err(HandlerError { message, retriable }) => TaskOutcome::Failure {
            error: message,
            retriable,
        },
    }
}

/// 任务处理器
///
/// Worker对每个认领到的任务调用一次。处理器可能在任何 `.await` 点被中止
/// （任务被取消或所有权被回收），因此不应假设一定能执行到结束。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<Option<serde_json::Value>, HandlerError>;
}

/// 按负载描述模拟执行的处理器
///
/// 负载字段：`duration_ms` 执行耗时，`fail` 为 `"retriable"` 或 `"fatal"` 时返回对应的失败。
#[derive(Debug, Default, Clone)]
pub struct SimulatedHandler;

#[async_trait]
impl TaskHandler for SimulatedHandler {
    async fn handle(&self, task: &Task) -> Result<Option<serde_json::Value>, HandlerError> {
        let duration_ms = task
            .payload
            .get("duration_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        debug!("模拟执行任务 {}，耗时 {}ms", task.id, duration_ms);
        if duration_ms > 0 {
            tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        }

        match task.payload.get("fail").and_then(|v| v.as_str()) {
            Some("retriable") => Err(HandlerError::retriable("simulated transient failure")),
            Some("fatal") => Err(HandlerError::fatal("simulated permanent failure")),
            _ => {
                info!("任务 {} ({}) 执行完成", task.id, task.priority);
                Ok(Some(json!({
                    "task_id": task.id.to_string(),
                    "attempt": task.retry_count + 1,
                })))
            }
        }
    }
}
