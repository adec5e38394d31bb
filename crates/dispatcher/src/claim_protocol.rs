use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use taskqueue_core::{
    config::QueueConfig,
    models::{ClaimOutcome, Task, TaskId, Transition, WorkerInfo},
    traits::QueueStore,
    SchedulerResult, ScoreFunction,
};
use taskqueue_infrastructure::{MetricsCollector, StructuredLogger};

/// 认领协议
///
/// 一次轮询最多进行 `max_claim_rounds` 轮：每轮读取 `剩余容量 × 超额系数` 个
/// 可见候选，逐个原子认领，认领成功后再按能力过滤，不匹配的任务立即释放回
/// 队列（保留原始入队时间）。竞争失败的候选直接跳过，不向调用方暴露。
pub struct ClaimProtocol {
    store: Arc<dyn QueueStore>,
    scorer: ScoreFunction,
    claim_window: Duration,
    oversubscribe_factor: usize,
    max_claim_rounds: usize,
    metrics: Arc<MetricsCollector>,
}

/// 单次轮询的认领结果
#[derive(Debug, Default)]
pub struct ClaimReport {
    pub claimed: Vec<Task>,
    /// 能力不匹配而释放的任务
    pub released: Vec<TaskId>,
    /// 竞争失败的候选数
    pub lost: usize,
}

impl ClaimProtocol {
    pub fn new(
        store: Arc<dyn QueueStore>,
        config: &QueueConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            scorer: ScoreFunction::from_config(config),
            claim_window: Duration::seconds(config.claim_window_seconds),
            oversubscribe_factor: config.oversubscribe_factor.max(1),
            max_claim_rounds: config.max_claim_rounds.max(1),
            metrics,
        }
    }

    pub async fn claim_for(
        &self,
        worker: &WorkerInfo,
        available_capacity: usize,
        now: DateTime<Utc>,
    ) -> SchedulerResult<ClaimReport> {
        let wanted = available_capacity.min(worker.free_slots() as usize);
        let mut report = ClaimReport::default();
        if wanted == 0 {
            return Ok(report);
        }

        let claim_until = now + self.claim_window;
        let mut seen: HashSet<TaskId> = HashSet::new();

        'rounds: for round in 0..self.max_claim_rounds {
            let remaining = wanted - report.claimed.len();
            let candidates = self
                .store
                .peek_visible(now, remaining * self.oversubscribe_factor, &seen)
                .await?;
            if candidates.is_empty() {
                break;
            }
            debug!(
                "Worker {} 第 {} 轮认领，候选 {} 个",
                worker.id,
                round + 1,
                candidates.len()
            );

            for entry in candidates {
                if report.claimed.len() >= wanted {
                    break 'rounds;
                }
                seen.insert(entry.task_id);

                match self
                    .store
                    .claim(entry.task_id, &worker.id, now, claim_until)
                    .await?
                {
                    ClaimOutcome::Claimed(task) => {
                        if worker.supports(&task.capabilities) {
                            let promoted = self.scorer.is_promoted(task.created_at, now);
                            self.metrics.record_claimed(
                                task.priority,
                                promoted,
                                task.age(now).num_milliseconds(),
                            );
                            StructuredLogger::log_task_claimed(&task, &worker.id, promoted);
                            report.claimed.push(task);
                        } else {
                            self.release(&task, &worker.id, now).await?;
                            report.released.push(task.id);
                        }
                    }
                    ClaimOutcome::Lost => report.lost += 1,
                    ClaimOutcome::WorkerFull => break 'rounds,
                    ClaimOutcome::WorkerUnavailable(reason) => {
                        debug!("Worker {} 不再接受新任务: {}", worker.id, reason);
                        break 'rounds;
                    }
                }
            }

            if report.claimed.len() >= wanted {
                break;
            }
        }

        Ok(report)
    }

    async fn release(&self, task: &Task, worker_id: &str, now: DateTime<Utc>) -> SchedulerResult<()> {
        debug!(
            "任务 {} 需要能力 {:?}，Worker {} 不满足，释放回队列",
            task.id, task.capabilities, worker_id
        );
        self.store
            .apply_transition(
                task.id,
                Transition::Release {
                    worker_id: worker_id.to_string(),
                },
                now,
            )
            .await?;
        self.metrics.record_capability_mismatch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{queue_config, start_time};
    use taskqueue_core::models::{
        RetryPolicy, TaskPriority, TaskStatus, TaskSubmission, WorkerRegistration,
    };
    use taskqueue_core::traits::WorkerRecovery;
    use taskqueue_infrastructure::InMemoryQueueStore;

    async fn setup() -> (Arc<InMemoryQueueStore>, ClaimProtocol) {
        let config = queue_config();
        let store = Arc::new(InMemoryQueueStore::new(ScoreFunction::from_config(&config)));
        let protocol = ClaimProtocol::new(store.clone(), &config, Arc::new(MetricsCollector::new()));
        (store, protocol)
    }

    async fn submit(store: &InMemoryQueueStore, submission: TaskSubmission, now: DateTime<Utc>) -> Task {
        let task = Task::from_submission(submission, &queue_config(), now);
        store.insert_task(task.clone(), now).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_claims_in_priority_order_up_to_capacity() {
        let (store, protocol) = setup().await;
        let now = start_time();
        let low = submit(&store, TaskSubmission::new(TaskPriority::Low), now).await;
        let high = submit(&store, TaskSubmission::new(TaskPriority::High), now).await;
        let medium = submit(&store, TaskSubmission::new(TaskPriority::Medium), now).await;
        let worker = store
            .register_worker(
                WorkerRegistration::new(2).with_id("w1"),
                WorkerRecovery::reregistered(RetryPolicy::default()),
                now,
            )
            .await
            .unwrap()
            .worker;

        let report = protocol.claim_for(&worker, 5, now).await.unwrap();
        let ids: Vec<_> = report.claimed.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high.id, medium.id]);

        let untouched = store.get_task(low.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_capability_mismatch_is_released_at_original_position() {
        let (store, protocol) = setup().await;
        let now = start_time();
        let gpu = submit(
            &store,
            TaskSubmission::new(TaskPriority::High).with_capabilities(["gpu"]),
            now,
        )
        .await;
        let plain = submit(&store, TaskSubmission::new(TaskPriority::Low), now).await;
        let worker = store
            .register_worker(
                WorkerRegistration::new(1).with_id("cpu-only"),
                WorkerRecovery::reregistered(RetryPolicy::default()),
                now,
            )
            .await
            .unwrap()
            .worker;

        let report = protocol.claim_for(&worker, 1, now).await.unwrap();
        assert_eq!(report.claimed.len(), 1);
        assert_eq!(report.claimed[0].id, plain.id);
        assert_eq!(report.released, vec![gpu.id]);

        let released = store.get_task(gpu.id).await.unwrap().unwrap();
        assert_eq!(released.status, TaskStatus::Queued);
        assert_eq!(released.created_at, gpu.created_at);
        assert_eq!(released.retry_count, 0);

        let peeked = store.peek_visible(now, 1, &HashSet::new()).await.unwrap();
        assert_eq!(peeked[0].task_id, gpu.id);
    }

    #[tokio::test]
    async fn test_draining_worker_claims_nothing() {
        let (store, protocol) = setup().await;
        let now = start_time();
        submit(&store, TaskSubmission::new(TaskPriority::High), now).await;
        store
            .register_worker(
                WorkerRegistration::new(2).with_id("w1"),
                WorkerRecovery::reregistered(RetryPolicy::default()),
                now,
            )
            .await
            .unwrap();
        let worker = store
            .update_worker("w1", taskqueue_core::models::WorkerUpdate::Drain, now)
            .await
            .unwrap();

        let report = protocol.claim_for(&worker, 2, now).await.unwrap();
        assert!(report.claimed.is_empty());
        assert_eq!(store.queued_entries().await.unwrap().len(), 1);
    }
}
