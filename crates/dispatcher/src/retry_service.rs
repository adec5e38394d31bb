use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use taskqueue_core::{
    models::{
        NoopKind, RetryPolicy, Task, TaskId, TaskStatus, Transition, TransitionOutcome,
    },
    traits::QueueStore,
    SchedulerError, SchedulerResult,
};
use taskqueue_infrastructure::{MetricsCollector, StructuredLogger};

/// 重试服务接口
#[async_trait]
pub trait RetryService: Send + Sync {
    /// 处理Worker上报的失败，按重试策略重新入队或进入死信
    ///
    /// `attempt` 是Worker认领时拿到的认领序号，与任务当前序号不一致的上报被忽略。
    async fn handle_failure(
        &self,
        worker_id: &str,
        task_id: TaskId,
        attempt: u32,
        error: String,
        retriable: bool,
        now: DateTime<Utc>,
    ) -> SchedulerResult<TransitionOutcome>;

    /// 重放死信任务，返回新任务ID。重复调用返回同一个新任务
    async fn replay(&self, task_id: TaskId, now: DateTime<Utc>) -> SchedulerResult<TaskId>;

    fn policy(&self) -> RetryPolicy;
}

/// 重试服务实现
pub struct TaskRetryService {
    store: Arc<dyn QueueStore>,
    policy: RetryPolicy,
    metrics: Arc<MetricsCollector>,
}

impl TaskRetryService {
    pub fn new(store: Arc<dyn QueueStore>, policy: RetryPolicy, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            store,
            policy,
            metrics,
        }
    }

    async fn load_dead_letter(&self, task_id: TaskId) -> SchedulerResult<Task> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;
        if task.status != TaskStatus::DeadLetter {
            return Err(SchedulerError::InvalidTransition(format!(
                "任务 {} 当前状态为 {}，只有死信任务可以重放",
                task_id, task.status
            )));
        }
        Ok(task)
    }
}

#[async_trait]
impl RetryService for TaskRetryService {
    async fn handle_failure(
        &self,
        worker_id: &str,
        task_id: TaskId,
        attempt: u32,
        error: String,
        retriable: bool,
        now: DateTime<Utc>,
    ) -> SchedulerResult<TransitionOutcome> {
        let outcome = self
            .store
            .apply_transition(
                task_id,
                Transition::Fail {
                    worker_id: worker_id.to_string(),
                    attempt,
                    error,
                    retriable,
                    policy: self.policy,
                },
                now,
            )
            .await?;

        if let TransitionOutcome::Applied { task, change } = &outcome {
            self.metrics.record_failed();
            let duration_ms = task
                .history
                .iter()
                .rev()
                .find(|r| r.to == TaskStatus::Executing)
                .map(|r| (now - r.at).num_milliseconds());
            StructuredLogger::log_task_finished(task, worker_id, false, duration_ms);
            if let Some(decision) = &change.retry {
                self.metrics.record_retry_decision(decision);
                StructuredLogger::log_retry_decision(task, decision);
            }
        }

        Ok(outcome)
    }

    async fn replay(&self, task_id: TaskId, now: DateTime<Utc>) -> SchedulerResult<TaskId> {
        let original = self.load_dead_letter(task_id).await?;
        if let Some(existing) = original.replayed_as {
            info!("死信任务 {} 已重放为 {}", task_id, existing);
            return Ok(existing);
        }

        let replay = Task::replay_from(&original, now);
        let replay_id = replay.id;
        self.store.insert_task(replay, now).await?;

        let marked = self
            .store
            .apply_transition(
                task_id,
                Transition::MarkReplayed {
                    new_task_id: replay_id,
                },
                now,
            )
            .await?;

        match marked {
            TransitionOutcome::Applied { .. } => {
                self.metrics.record_replayed();
                info!("死信任务 {} 已重放为新任务 {}", task_id, replay_id);
                Ok(replay_id)
            }
            TransitionOutcome::Noop { task, kind } => {
                // 并发重放时只保留先标记成功的那一个
                self.store
                    .apply_transition(
                        replay_id,
                        Transition::Cancel {
                            reason: Some("duplicate replay".to_string()),
                        },
                        now,
                    )
                    .await?;
                match (kind, task.replayed_as) {
                    (NoopKind::AlreadyApplied, Some(winner)) => Ok(winner),
                    _ => {
                        warn!("死信任务 {} 在重放过程中状态发生变化", task_id);
                        Err(SchedulerError::InvalidTransition(format!(
                            "任务 {task_id} 已不是死信任务"
                        )))
                    }
                }
            }
        }
    }

    fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{queue_config, start_time};
    use chrono::Duration;
    use taskqueue_core::models::{TaskPriority, TaskSubmission, TransitionReason, WorkerRegistration};
    use taskqueue_core::traits::WorkerRecovery;
    use taskqueue_core::ScoreFunction;
    use taskqueue_infrastructure::InMemoryQueueStore;

    async fn claimed_task(
        store: &Arc<InMemoryQueueStore>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Task {
        let task = Task::from_submission(
            TaskSubmission::new(TaskPriority::High)
                .with_max_retries(max_retries)
                .with_timeout_seconds(60),
            &queue_config(),
            now,
        );
        store.insert_task(task.clone(), now).await.unwrap();
        store
            .register_worker(
                WorkerRegistration::new(4).with_id("w1"),
                WorkerRecovery::reregistered(RetryPolicy::default()),
                now,
            )
            .await
            .unwrap();
        store
            .claim(task.id, "w1", now, now + Duration::seconds(30))
            .await
            .unwrap();
        task
    }

    fn service(store: Arc<InMemoryQueueStore>) -> (TaskRetryService, Arc<MetricsCollector>) {
        let metrics = Arc::new(MetricsCollector::new());
        (
            TaskRetryService::new(store, RetryPolicy::default(), metrics.clone()),
            metrics,
        )
    }

    #[tokio::test]
    async fn test_retriable_failure_requeues_with_backoff() {
        let store = Arc::new(InMemoryQueueStore::new(ScoreFunction::default()));
        let now = start_time();
        let task = claimed_task(&store, 3, now).await;
        let (service, metrics) = service(store.clone());

        let outcome = service
            .handle_failure("w1", task.id, 1, "boom".to_string(), true, now)
            .await
            .unwrap();
        let requeued = outcome.task();
        assert_eq!(requeued.status, TaskStatus::Queued);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.timeout_ms, 90_000);
        assert_eq!(requeued.created_at, task.created_at);
        assert_eq!(metrics.snapshot().requeued, 1);
    }

    #[tokio::test]
    async fn test_non_retriable_failure_dead_letters() {
        let store = Arc::new(InMemoryQueueStore::new(ScoreFunction::default()));
        let now = start_time();
        let task = claimed_task(&store, 3, now).await;
        let (service, metrics) = service(store.clone());

        let outcome = service
            .handle_failure("w1", task.id, 1, "bad input".to_string(), false, now)
            .await
            .unwrap();
        assert_eq!(outcome.task().status, TaskStatus::DeadLetter);
        assert_eq!(
            outcome.task().terminal_reason.as_deref(),
            Some(TransitionReason::NonRetriable.as_str())
        );
        assert_eq!(metrics.snapshot().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let store = Arc::new(InMemoryQueueStore::new(ScoreFunction::default()));
        let now = start_time();
        let task = claimed_task(&store, 0, now).await;
        let (service, metrics) = service(store.clone());
        service
            .handle_failure("w1", task.id, 1, "boom".to_string(), true, now)
            .await
            .unwrap();

        let later = now + Duration::seconds(10);
        let first = service.replay(task.id, later).await.unwrap();
        let second = service.replay(task.id, later).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(metrics.snapshot().replayed, 1);

        let replayed = store.get_task(first).await.unwrap().unwrap();
        assert_eq!(replayed.status, TaskStatus::Queued);
        assert_eq!(replayed.retry_count, 0);
        assert_eq!(replayed.replay_of, Some(task.id));
        assert_eq!(replayed.created_at, later);
    }

    #[tokio::test]
    async fn test_replay_rejects_live_task() {
        let store = Arc::new(InMemoryQueueStore::new(ScoreFunction::default()));
        let now = start_time();
        let task = claimed_task(&store, 3, now).await;
        let (service, _) = service(store);

        let err = service.replay(task.id, now).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition(_)));
    }
}
