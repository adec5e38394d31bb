use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Task, TaskId, TaskPriority, TaskStatus};

/// 优先级索引中的条目
///
/// 只保存时间无关的字段，排序分数在读取时根据当前时间计算。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub visible_until: Option<DateTime<Utc>>,
    pub status: TaskStatus,
}

impl QueueEntry {
    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Queued && self.visible_until.map_or(true, |until| now >= until)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).max(Duration::zero())
    }
}

/// 提交结果
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    pub task: Task,
    /// 为 false 表示命中了有效期内的幂等键，返回的是已存在的任务
    pub created: bool,
}

/// 单次认领尝试的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Task),
    /// 任务已被其他Worker认领、已取消或尚不可见
    Lost,
    /// Worker已达到容量上限
    WorkerFull,
    /// Worker不可分配（排空中、不可达或健康探测暂停）
    WorkerUnavailable(String),
}
