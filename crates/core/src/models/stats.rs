use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{QueueEntry, TaskPriority, TaskStatus, WorkerInfo, WorkerStatus};

/// 单个优先级的队列深度与等待时长分布（毫秒）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriorityQueueStats {
    pub depth: usize,
    pub age_p50_ms: i64,
    pub age_p90_ms: i64,
    pub age_p99_ms: i64,
    pub age_max_ms: i64,
}

impl PriorityQueueStats {
    /// 根据排队任务的等待时长计算，使用最近秩法取分位数
    pub fn from_ages(mut ages_ms: Vec<i64>) -> Self {
        if ages_ms.is_empty() {
            return Self::default();
        }
        ages_ms.sort_unstable();
        Self {
            depth: ages_ms.len(),
            age_p50_ms: percentile(&ages_ms, 50.0),
            age_p90_ms: percentile(&ages_ms, 90.0),
            age_p99_ms: percentile(&ages_ms, 99.0),
            age_max_ms: ages_ms[ages_ms.len() - 1],
        }
    }
}

fn percentile(sorted: &[i64], p: f64) -> i64 {
    let rank = (p * sorted.len() as f64 / 100.0).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// 队列统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub by_priority: BTreeMap<TaskPriority, PriorityQueueStats>,
    pub queued: usize,
    pub claimed: usize,
    pub executing: usize,
    pub dead_letter: usize,
    pub generated_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    /// 由索引条目计算，`executing` 与 `dead_letter` 由登记表提供
    pub fn from_entries(
        entries: &[QueueEntry],
        executing: usize,
        dead_letter: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let mut ages: BTreeMap<TaskPriority, Vec<i64>> = TaskPriority::ALL
            .iter()
            .map(|priority| (*priority, Vec::new()))
            .collect();
        let mut claimed = 0;

        for entry in entries {
            match entry.status {
                TaskStatus::Queued => ages
                    .entry(entry.priority)
                    .or_default()
                    .push(entry.age(now).num_milliseconds()),
                TaskStatus::Claimed => claimed += 1,
                _ => {}
            }
        }

        let by_priority: BTreeMap<_, _> = ages
            .into_iter()
            .map(|(priority, ages)| (priority, PriorityQueueStats::from_ages(ages)))
            .collect();
        let queued = by_priority.values().map(|s| s.depth).sum();

        Self {
            by_priority,
            queued,
            claimed,
            executing,
            dead_letter,
            generated_at: Some(now),
        }
    }

    pub fn depth(&self, priority: TaskPriority) -> usize {
        self.by_priority.get(&priority).map_or(0, |s| s.depth)
    }
}

/// Worker统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub capacity: u32,
    pub load: u32,
    pub recent_failures: u32,
    pub assignments_suspended: bool,
    pub last_heartbeat: DateTime<Utc>,
}

impl From<&WorkerInfo> for WorkerStats {
    fn from(worker: &WorkerInfo) -> Self {
        Self {
            worker_id: worker.id.clone(),
            status: worker.status,
            capacity: worker.capacity,
            load: worker.load,
            recent_failures: worker.recent_failures,
            assignments_suspended: worker.assignments_suspended,
            last_heartbeat: worker.last_heartbeat,
        }
    }
}

/// 调度器累计计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounters {
    pub submitted: u64,
    pub deduplicated: u64,
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub cancelled: u64,
    pub replayed: u64,
    pub promotions_by_aging: u64,
    pub capability_mismatches: u64,
    pub recovered_heartbeat: u64,
    pub recovered_assignment: u64,
    pub recovered_task_timeout: u64,
    pub workers_marked_unreachable: u64,
    pub duplicate_reports: u64,
    pub stale_reports: u64,
    pub degraded_polls: u64,
}
