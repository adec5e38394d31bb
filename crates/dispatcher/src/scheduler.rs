use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use taskqueue_core::{
    config::{AppConfig, QueueConfig},
    models::{
        NoopKind, QueueCounters, QueueStats, RetryPolicy, StateTransition, Task, TaskId,
        TaskOutcome, TaskStatus, TaskSubmission, Transition, TransitionOutcome, WorkerInfo,
        WorkerRegistration, WorkerStats, WorkerStatus, WorkerUpdate,
    },
    traits::{
        Clock, HeartbeatAck, QueueStore, ReportAck, SubmitReceipt, TaskQueueService,
        WorkerRecovery,
    },
    SchedulerError, SchedulerResult,
};
use taskqueue_infrastructure::{MetricsCollector, StructuredLogger};

use crate::claim_protocol::ClaimProtocol;
use crate::retry_service::{RetryService, TaskRetryService};
use crate::worker_failure_detector::record_recovered;

/// 任务队列调度器
///
/// `TaskQueueService` 的实现。本身不持有任何后台线程，所有状态都在共享存储里，
/// 多个调度器实例可以指向同一个存储。
pub struct TaskQueueScheduler {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    queue_config: QueueConfig,
    claim_protocol: ClaimProtocol,
    retry_service: Arc<dyn RetryService>,
    metrics: Arc<MetricsCollector>,
}

impl TaskQueueScheduler {
    pub fn new(store: Arc<dyn QueueStore>, clock: Arc<dyn Clock>, config: &AppConfig) -> Self {
        Self::with_metrics(store, clock, config, Arc::new(MetricsCollector::new()))
    }

    pub fn with_metrics(
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        config: &AppConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let retry_service = Arc::new(TaskRetryService::new(
            store.clone(),
            RetryPolicy::from_config(&config.retry),
            metrics.clone(),
        ));
        Self {
            claim_protocol: ClaimProtocol::new(store.clone(), &config.queue, metrics.clone()),
            store,
            clock,
            queue_config: config.queue.clone(),
            retry_service,
            metrics,
        }
    }

    pub fn store(&self) -> Arc<dyn QueueStore> {
        Arc::clone(&self.store)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    async fn require_task(&self, task_id: TaskId) -> SchedulerResult<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })
    }

    async fn require_worker(&self, worker_id: &str) -> SchedulerResult<WorkerInfo> {
        self.store
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: worker_id.to_string(),
            })
    }

    fn acknowledge(&self, outcome: &TransitionOutcome, worker_id: &str) -> ReportAck {
        match outcome {
            TransitionOutcome::Applied { .. } => ReportAck::Accepted,
            TransitionOutcome::Noop {
                task,
                kind: NoopKind::AlreadyApplied,
            } => {
                self.metrics.record_duplicate_report();
                StructuredLogger::log_ignored_report(task, worker_id, "duplicate");
                ReportAck::Duplicate
            }
            TransitionOutcome::Noop {
                task,
                kind: NoopKind::Stale,
            } => {
                self.metrics.record_stale_report();
                StructuredLogger::log_ignored_report(task, worker_id, "stale");
                ReportAck::Stale
            }
        }
    }

    async fn claim_tasks(
        &self,
        worker_id: &str,
        available_capacity: usize,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Task>> {
        let worker = self.require_worker(worker_id).await?;
        match worker.status {
            WorkerStatus::Unreachable => {
                return Err(SchedulerError::WorkerUnavailable {
                    id: worker.id,
                    reason: "已被标记为不可达，需要重新注册".to_string(),
                });
            }
            WorkerStatus::Draining => {
                debug!("Worker {} 正在排空，不分配新任务", worker_id);
                return Ok(Vec::new());
            }
            WorkerStatus::Active => {}
        }

        let report = self
            .claim_protocol
            .claim_for(&worker, available_capacity, now)
            .await?;
        if report.lost > 0 || !report.released.is_empty() {
            debug!(
                "Worker {} 本次轮询: 认领 {}，竞争失败 {}，能力不匹配 {}",
                worker_id,
                report.claimed.len(),
                report.lost,
                report.released.len()
            );
        }
        Ok(report.claimed)
    }
}

#[async_trait]
impl TaskQueueService for TaskQueueScheduler {
    async fn submit(&self, submission: TaskSubmission) -> SchedulerResult<SubmitReceipt> {
        submission.validate()?;
        let now = self.clock.now();
        let task = Task::from_submission(submission, &self.queue_config, now);

        let outcome = self.store.insert_task(task, now).await?;
        self.metrics
            .record_submitted(outcome.task.priority, outcome.created);
        StructuredLogger::log_task_submitted(&outcome.task, outcome.created);

        Ok(SubmitReceipt {
            task_id: outcome.task.id,
            created: outcome.created,
        })
    }

    async fn get_status(&self, task_id: TaskId) -> SchedulerResult<Task> {
        self.require_task(task_id).await
    }

    async fn cancel(&self, task_id: TaskId, reason: Option<String>) -> SchedulerResult<bool> {
        let now = self.clock.now();
        let outcome = self
            .store
            .apply_transition(task_id, Transition::Cancel { reason }, now)
            .await?;

        match outcome {
            TransitionOutcome::Applied { task, change } => {
                self.metrics.record_cancelled();
                info!(
                    "任务 {} 已取消 (原状态: {}, Worker: {:?})",
                    task.id, change.from, change.released_worker
                );
                Ok(true)
            }
            TransitionOutcome::Noop { task, .. } => {
                debug!("任务 {} 已处于终态 {}，取消请求被忽略", task.id, task.status);
                Ok(false)
            }
        }
    }

    async fn register_worker(
        &self,
        registration: WorkerRegistration,
    ) -> SchedulerResult<WorkerInfo> {
        registration.validate()?;
        let recovery = WorkerRecovery::reregistered(self.retry_service.policy());
        let outcome = self
            .store
            .register_worker(registration, recovery, self.clock.now())
            .await?;
        if !outcome.recovered.is_empty() {
            warn!(
                "Worker {} 重新注册，回收旧实例遗留的任务 {} 个",
                outcome.worker.id,
                outcome.recovered.len()
            );
            record_recovered(
                &self.metrics,
                &outcome.worker.id,
                recovery.reason,
                &outcome.recovered,
            );
        }
        StructuredLogger::log_worker_registered(&outcome.worker);
        Ok(outcome.worker)
    }

    async fn drain_worker(&self, worker_id: &str) -> SchedulerResult<WorkerInfo> {
        let worker = self
            .store
            .update_worker(worker_id, WorkerUpdate::Drain, self.clock.now())
            .await?;
        info!("Worker {} 进入排空状态，剩余任务 {}", worker_id, worker.load);
        Ok(worker)
    }

    async fn poll(&self, worker_id: &str, available_capacity: usize) -> SchedulerResult<Vec<Task>> {
        let now = self.clock.now();
        match self.claim_tasks(worker_id, available_capacity, now).await {
            Ok(tasks) => Ok(tasks),
            Err(e) if e.is_degraded() => {
                // 无法确认所有权时不分配任何任务
                self.metrics.record_degraded_poll();
                warn!("存储不可用，Worker {} 本次轮询返回空: {}", worker_id, e);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn report_start(
        &self,
        worker_id: &str,
        task_id: TaskId,
        attempt: u32,
    ) -> SchedulerResult<ReportAck> {
        let outcome = self
            .store
            .apply_transition(
                task_id,
                Transition::Start {
                    worker_id: worker_id.to_string(),
                    attempt,
                },
                self.clock.now(),
            )
            .await?;
        if outcome.is_applied() {
            debug!("任务 {} 已在Worker {} 上开始执行", task_id, worker_id);
        }
        Ok(self.acknowledge(&outcome, worker_id))
    }

    async fn report_result(
        &self,
        worker_id: &str,
        task_id: TaskId,
        attempt: u32,
        outcome: TaskOutcome,
    ) -> SchedulerResult<ReportAck> {
        let now = self.clock.now();
        let transition_outcome = match outcome {
            TaskOutcome::Success { output } => {
                let outcome = self
                    .store
                    .apply_transition(
                        task_id,
                        Transition::Complete {
                            worker_id: worker_id.to_string(),
                            attempt,
                            output,
                        },
                        now,
                    )
                    .await?;
                if let TransitionOutcome::Applied { task, .. } = &outcome {
                    let duration_ms = task
                        .started_at
                        .zip(task.finished_at)
                        .map(|(started, finished)| (finished - started).num_milliseconds());
                    self.metrics.record_completed(duration_ms);
                    StructuredLogger::log_task_finished(task, worker_id, true, duration_ms);
                }
                outcome
            }
            TaskOutcome::Failure { error, retriable } => {
                self.retry_service
                    .handle_failure(worker_id, task_id, attempt, error, retriable, now)
                    .await?
            }
        };

        Ok(self.acknowledge(&transition_outcome, worker_id))
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        running_tasks: &[TaskId],
    ) -> SchedulerResult<HeartbeatAck> {
        let reported_load = u32::try_from(running_tasks.len()).unwrap_or(u32::MAX);
        let worker = self
            .store
            .update_worker(
                worker_id,
                WorkerUpdate::Heartbeat { reported_load },
                self.clock.now(),
            )
            .await?;
        StructuredLogger::log_worker_heartbeat(&worker);

        let mut ack = HeartbeatAck::default();
        for task_id in running_tasks {
            match self.store.get_task(*task_id).await? {
                Some(task) if task.status == TaskStatus::Cancelled => ack.cancelled.push(*task_id),
                Some(task) if task.is_owned_by(worker_id) => {}
                _ => ack.revoked.push(*task_id),
            }
        }

        if !ack.is_empty() {
            info!(
                "Worker {} 需要中止任务: 已取消 {:?}，已回收 {:?}",
                worker_id, ack.cancelled, ack.revoked
            );
        }
        Ok(ack)
    }

    async fn replay_dead_letter(&self, task_id: TaskId) -> SchedulerResult<TaskId> {
        self.retry_service.replay(task_id, self.clock.now()).await
    }

    async fn dead_letters(&self) -> SchedulerResult<Vec<Task>> {
        self.store.tasks_by_status(TaskStatus::DeadLetter).await
    }

    async fn queue_stats(&self) -> SchedulerResult<QueueStats> {
        let now = self.clock.now();
        let entries = self.store.queued_entries().await?;
        let executing = self.store.tasks_by_status(TaskStatus::Executing).await?.len();
        let dead_letter = self.store.tasks_by_status(TaskStatus::DeadLetter).await?.len();

        let stats = QueueStats::from_entries(&entries, executing, dead_letter, now);
        self.metrics.update_queue_stats(&stats);
        Ok(stats)
    }

    async fn worker_stats(&self) -> SchedulerResult<Vec<WorkerStats>> {
        let workers = self.store.list_workers().await?;
        let active = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Active)
            .count();
        self.metrics.update_active_workers(active);
        Ok(workers.iter().map(WorkerStats::from).collect())
    }

    async fn task_history(&self, task_id: TaskId) -> SchedulerResult<Vec<StateTransition>> {
        Ok(self.require_task(task_id).await?.history)
    }

    fn counters(&self) -> QueueCounters {
        self.metrics.snapshot()
    }
}
