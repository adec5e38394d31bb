//! Metrics collector for the task queue
//!
//! 每个计数器同时写入进程内的原子计数（供 `counters()` 查询和测试断言）和
//! `metrics` 门面（安装了Prometheus导出器时对外暴露）。

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge, histogram};
use taskqueue_core::models::{
    QueueCounters, QueueStats, RetryDecision, TaskPriority, TransitionReason,
};

#[derive(Debug, Default)]
pub struct MetricsCollector {
    submitted: AtomicU64,
    deduplicated: AtomicU64,
    claimed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    cancelled: AtomicU64,
    replayed: AtomicU64,
    promotions_by_aging: AtomicU64,
    capability_mismatches: AtomicU64,
    recovered_heartbeat: AtomicU64,
    recovered_assignment: AtomicU64,
    recovered_task_timeout: AtomicU64,
    workers_marked_unreachable: AtomicU64,
    duplicate_reports: AtomicU64,
    stale_reports: AtomicU64,
    degraded_polls: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self, priority: TaskPriority, created: bool) {
        if created {
            bump(&self.submitted);
            counter!("taskqueue_tasks_submitted_total", "priority" => priority.as_str()).increment(1);
        } else {
            bump(&self.deduplicated);
            counter!("taskqueue_tasks_deduplicated_total").increment(1);
        }
    }

    pub fn record_claimed(&self, priority: TaskPriority, promoted: bool, wait_ms: i64) {
        bump(&self.claimed);
        counter!("taskqueue_tasks_claimed_total", "priority" => priority.as_str()).increment(1);
        histogram!("taskqueue_queue_wait_seconds", "priority" => priority.as_str())
            .record(wait_ms.max(0) as f64 / 1000.0);
        if promoted {
            bump(&self.promotions_by_aging);
            counter!("taskqueue_promotions_by_aging_total", "priority" => priority.as_str())
                .increment(1);
        }
    }

    pub fn record_capability_mismatch(&self) {
        bump(&self.capability_mismatches);
        counter!("taskqueue_capability_mismatches_total").increment(1);
    }

    pub fn record_completed(&self, duration_ms: Option<i64>) {
        bump(&self.completed);
        counter!("taskqueue_tasks_completed_total").increment(1);
        if let Some(duration_ms) = duration_ms {
            histogram!("taskqueue_task_execution_seconds").record(duration_ms.max(0) as f64 / 1000.0);
        }
    }

    pub fn record_failed(&self) {
        bump(&self.failed);
        counter!("taskqueue_tasks_failed_total").increment(1);
    }

    /// 记录失败或回收之后的重试判定
    pub fn record_retry_decision(&self, decision: &RetryDecision) {
        match decision {
            RetryDecision::Requeue { counted, .. } => {
                bump(&self.requeued);
                counter!(
                    "taskqueue_tasks_requeued_total",
                    "counted" => if *counted { "true" } else { "false" }
                )
                .increment(1);
            }
            RetryDecision::DeadLetter { reason, .. } => {
                bump(&self.dead_lettered);
                counter!("taskqueue_tasks_dead_lettered_total", "reason" => reason.as_str())
                    .increment(1);
            }
        }
    }

    pub fn record_cancelled(&self) {
        bump(&self.cancelled);
        counter!("taskqueue_tasks_cancelled_total").increment(1);
    }

    pub fn record_replayed(&self) {
        bump(&self.replayed);
        counter!("taskqueue_tasks_replayed_total").increment(1);
    }

    /// 按回收原因记录一次任务回收
    pub fn record_recovery(&self, reason: TransitionReason) {
        let slot = match reason {
            TransitionReason::HeartbeatTimeout
            | TransitionReason::HealthCheckFailed
            | TransitionReason::WorkerReregistered => &self.recovered_heartbeat,
            TransitionReason::AssignmentTimeout => &self.recovered_assignment,
            TransitionReason::TaskTimeout => &self.recovered_task_timeout,
            _ => return,
        };
        bump(slot);
        counter!("taskqueue_tasks_recovered_total", "reason" => reason.as_str()).increment(1);
    }

    pub fn record_worker_unreachable(&self) {
        bump(&self.workers_marked_unreachable);
        counter!("taskqueue_workers_unreachable_total").increment(1);
    }

    pub fn record_duplicate_report(&self) {
        bump(&self.duplicate_reports);
        counter!("taskqueue_reports_ignored_total", "kind" => "duplicate").increment(1);
    }

    pub fn record_stale_report(&self) {
        bump(&self.stale_reports);
        counter!("taskqueue_reports_ignored_total", "kind" => "stale").increment(1);
    }

    pub fn record_degraded_poll(&self) {
        bump(&self.degraded_polls);
        counter!("taskqueue_degraded_polls_total").increment(1);
    }

    /// 更新队列深度与等待时间分位数仪表
    pub fn update_queue_stats(&self, stats: &QueueStats) {
        for (priority, entry) in &stats.by_priority {
            let label = priority.as_str();
            gauge!("taskqueue_queue_depth", "priority" => label).set(entry.depth as f64);
            gauge!("taskqueue_queue_age_p99_seconds", "priority" => label)
                .set(entry.age_p99_ms as f64 / 1000.0);
            gauge!("taskqueue_queue_age_max_seconds", "priority" => label)
                .set(entry.age_max_ms as f64 / 1000.0);
        }
        gauge!("taskqueue_tasks_executing").set(stats.executing as f64);
        gauge!("taskqueue_tasks_dead_letter").set(stats.dead_letter as f64);
    }

    pub fn update_active_workers(&self, count: usize) {
        gauge!("taskqueue_active_workers").set(count as f64);
    }

    pub fn snapshot(&self) -> QueueCounters {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        QueueCounters {
            submitted: read(&self.submitted),
            deduplicated: read(&self.deduplicated),
            claimed: read(&self.claimed),
            completed: read(&self.completed),
            failed: read(&self.failed),
            requeued: read(&self.requeued),
            dead_lettered: read(&self.dead_lettered),
            cancelled: read(&self.cancelled),
            replayed: read(&self.replayed),
            promotions_by_aging: read(&self.promotions_by_aging),
            capability_mismatches: read(&self.capability_mismatches),
            recovered_heartbeat: read(&self.recovered_heartbeat),
            recovered_assignment: read(&self.recovered_assignment),
            recovered_task_timeout: read(&self.recovered_task_timeout),
            workers_marked_unreachable: read(&self.workers_marked_unreachable),
            duplicate_reports: read(&self.duplicate_reports),
            stale_reports: read(&self.stale_reports),
            degraded_polls: read(&self.degraded_polls),
        }
    }
}
