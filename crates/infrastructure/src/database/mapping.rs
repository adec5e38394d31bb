//! 数据库行与领域模型之间的映射
//!
//! 任务与Worker的完整记录以JSON保存在 `body` 列，其余列只是为了索引和
//! 条件查询而冗余存储的字段。时间统一存为毫秒时间戳。

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use taskqueue_core::models::{Task, WorkerInfo};
use taskqueue_core::{SchedulerError, SchedulerResult};

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn task_from_row(row: &SqliteRow) -> SchedulerResult<Task> {
        let body: String = row.try_get("body")?;
        serde_json::from_str(&body)
            .map_err(|e| SchedulerError::Serialization(format!("解析任务记录失败: {e}")))
    }

    /// 解析Worker记录，负载取自同一查询中的 `load` 列
    pub fn worker_from_row(row: &SqliteRow) -> SchedulerResult<WorkerInfo> {
        let body: String = row.try_get("body")?;
        let mut worker: WorkerInfo = serde_json::from_str(&body)
            .map_err(|e| SchedulerError::Serialization(format!("解析Worker记录失败: {e}")))?;
        let load: i64 = row.try_get("load")?;
        worker.load = u32::try_from(load).unwrap_or(u32::MAX);
        Ok(worker)
    }

    pub fn to_json<T: serde::Serialize>(value: &T) -> SchedulerResult<String> {
        serde_json::to_string(value)
            .map_err(|e| SchedulerError::Serialization(format!("序列化记录失败: {e}")))
    }

    pub fn millis(time: DateTime<Utc>) -> i64 {
        time.timestamp_millis()
    }

    pub fn optional_millis(time: Option<DateTime<Utc>>) -> Option<i64> {
        time.map(|t| t.timestamp_millis())
    }
}
