use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use taskqueue_core::{
    config::RecoveryConfig,
    models::{RetryPolicy, Task, TaskId, TaskStatus, Transition, TransitionOutcome, TransitionReason},
    traits::QueueStore,
    SchedulerResult,
};
use taskqueue_infrastructure::{MetricsCollector, StructuredLogger};

/// 一次恢复扫描的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub requeued: Vec<TaskId>,
    pub dead_lettered: Vec<TaskId>,
    /// 扫描期间状态已发生变化而被跳过的任务
    pub skipped: usize,
}

impl RecoveryReport {
    pub fn recovered(&self) -> usize {
        self.requeued.len() + self.dead_lettered.len()
    }

    pub fn merge(&mut self, other: RecoveryReport) {
        self.requeued.extend(other.requeued);
        self.dead_lettered.extend(other.dead_lettered);
        self.skipped += other.skipped;
    }
}

/// 任务超时恢复服务接口
#[async_trait]
pub trait RecoveryService: Send + Sync {
    /// 认领后未在认领窗口内上报开始的任务重新入队
    async fn scan_assignment_timeouts(&self, now: DateTime<Utc>) -> SchedulerResult<RecoveryReport>;

    /// 执行超过单次超时时间的任务按超时策略处理
    async fn scan_task_timeouts(&self, now: DateTime<Utc>) -> SchedulerResult<RecoveryReport>;
}

/// 任务超时恢复服务实现
pub struct TaskRecoveryService {
    store: Arc<dyn QueueStore>,
    policy: RetryPolicy,
    clock_skew: Duration,
    metrics: Arc<MetricsCollector>,
}

impl TaskRecoveryService {
    pub fn new(
        store: Arc<dyn QueueStore>,
        config: &RecoveryConfig,
        policy: RetryPolicy,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            policy,
            clock_skew: config.clock_skew(),
            metrics,
        }
    }

    /// 执行进度比例：持有者最后一次心跳距开始执行的时间占超时时间的比例
    async fn progress_fraction(&self, task: &Task, worker_id: &str) -> SchedulerResult<Option<f64>> {
        let Some(started_at) = task.started_at else {
            return Ok(None);
        };
        if task.timeout_ms <= 0 {
            return Ok(None);
        }
        let Some(worker) = self.store.get_worker(worker_id).await? else {
            return Ok(None);
        };
        let elapsed_ms = (worker.last_heartbeat - started_at).num_milliseconds().max(0);
        Ok(Some(elapsed_ms as f64 / task.timeout_ms as f64))
    }

    async fn recover(
        &self,
        task: &Task,
        worker_id: &str,
        reason: TransitionReason,
        progress: Option<f64>,
        now: DateTime<Utc>,
        report: &mut RecoveryReport,
    ) -> SchedulerResult<()> {
        let outcome = self
            .store
            .apply_transition(
                task.id,
                Transition::Recover {
                    worker_id: worker_id.to_string(),
                    attempt: task.attempt,
                    expected: task.status,
                    reason,
                    policy: self.policy,
                    progress,
                },
                now,
            )
            .await?;

        match outcome {
            TransitionOutcome::Applied { task, change } => {
                self.metrics.record_recovery(reason);
                StructuredLogger::log_task_recovered(&task, worker_id, reason);
                if let Some(decision) = &change.retry {
                    self.metrics.record_retry_decision(decision);
                    StructuredLogger::log_retry_decision(&task, decision);
                }
                if task.status == TaskStatus::DeadLetter {
                    report.dead_lettered.push(task.id);
                } else {
                    report.requeued.push(task.id);
                }
            }
            TransitionOutcome::Noop { task, .. } => {
                debug!(
                    "任务 {} 在恢复扫描期间状态已变为 {}，跳过",
                    task.id, task.status
                );
                report.skipped += 1;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RecoveryService for TaskRecoveryService {
    async fn scan_assignment_timeouts(&self, now: DateTime<Utc>) -> SchedulerResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for task in self.store.tasks_by_status(TaskStatus::Claimed).await? {
            if !task.claim_expired(now, self.clock_skew) {
                continue;
            }
            let Some(worker_id) = task.assigned_worker.clone() else {
                continue;
            };
            warn!(
                "任务 {} 由Worker {} 认领后未在认领窗口内开始执行",
                task.id, worker_id
            );
            self.recover(
                &task,
                &worker_id,
                TransitionReason::AssignmentTimeout,
                None,
                now,
                &mut report,
            )
            .await?;
        }

        if report.recovered() > 0 {
            info!("认领超时扫描回收了 {} 个任务", report.recovered());
        }
        Ok(report)
    }

    async fn scan_task_timeouts(&self, now: DateTime<Utc>) -> SchedulerResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for task in self.store.tasks_by_status(TaskStatus::Executing).await? {
            if !task.execution_expired(now, self.clock_skew) {
                continue;
            }
            let Some(worker_id) = task.assigned_worker.clone() else {
                continue;
            };
            let progress = self.progress_fraction(&task, &worker_id).await?;
            warn!(
                "任务 {} 在Worker {} 上执行超时 (超时时间 {}ms，进度比例 {:?})",
                task.id, worker_id, task.timeout_ms, progress
            );
            self.recover(
                &task,
                &worker_id,
                TransitionReason::TaskTimeout,
                progress,
                now,
                &mut report,
            )
            .await?;
        }

        if report.recovered() > 0 {
            info!("执行超时扫描回收了 {} 个任务", report.recovered());
        }
        Ok(report)
    }
}
