#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use taskqueue_core::config::AppConfig;
use taskqueue_core::models::{Task, TaskId, TaskOutcome, TaskPriority, TaskSubmission, WorkerRegistration};
use taskqueue_core::traits::{ManualClock, TaskQueueService};
use taskqueue_core::ScoreFunction;
use taskqueue_dispatcher::{RecoverySupervisor, TaskQueueScheduler};
use taskqueue_infrastructure::{InMemoryQueueStore, MetricsCollector};

pub struct Harness {
    pub store: Arc<InMemoryQueueStore>,
    pub clock: Arc<ManualClock>,
    pub scheduler: Arc<TaskQueueScheduler>,
    pub supervisor: RecoverySupervisor,
    pub config: AppConfig,
    pub start: DateTime<Utc>,
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.queue.priority_gap_seconds = 60;
    config.queue.max_wait_seconds = 600;
    config.queue.claim_window_seconds = 30;
    config.recovery.heartbeat_interval_seconds = 10;
    config.recovery.heartbeat_miss_factor = 3;
    config
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let start = start_time();
        let store = Arc::new(InMemoryQueueStore::new(ScoreFunction::from_config(&config.queue)));
        let clock = Arc::new(ManualClock::new(start));
        let metrics = Arc::new(MetricsCollector::new());
        let scheduler = Arc::new(TaskQueueScheduler::with_metrics(
            store.clone(),
            clock.clone(),
            &config,
            metrics.clone(),
        ));
        let supervisor = RecoverySupervisor::new(store.clone(), clock.clone(), metrics, &config);
        Self {
            store,
            clock,
            scheduler,
            supervisor,
            config,
            start,
        }
    }

    /// 把时钟设置为起点之后的第 `seconds` 秒
    pub fn at(&self, seconds: i64) -> DateTime<Utc> {
        let now = self.start + Duration::seconds(seconds);
        self.clock.set(now);
        now
    }

    pub async fn submit(&self, priority: TaskPriority) -> TaskId {
        self.scheduler
            .submit(TaskSubmission::new(priority))
            .await
            .unwrap()
            .task_id
    }

    pub async fn worker(&self, id: &str, capacity: u32) -> String {
        self.scheduler
            .register_worker(WorkerRegistration::new(capacity).with_id(id))
            .await
            .unwrap()
            .id
    }

    pub async fn task(&self, id: TaskId) -> Task {
        self.scheduler.get_status(id).await.unwrap()
    }

    /// 任务当前的认领序号
    pub async fn attempt(&self, id: TaskId) -> u32 {
        self.task(id).await.attempt
    }

    /// 以当前认领序号开始并成功完成一个已认领的任务
    pub async fn run_to_completion(&self, worker_id: &str, task_id: TaskId) {
        let attempt = self.attempt(task_id).await;
        self.scheduler
            .report_start(worker_id, task_id, attempt)
            .await
            .unwrap();
        self.scheduler
            .report_result(worker_id, task_id, attempt, TaskOutcome::success(None))
            .await
            .unwrap();
    }
}
