use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taskqueue_core::models::{Task, TaskId};
use taskqueue_core::traits::{ReportAck, TaskQueueService};

use crate::handler::{into_outcome, TaskHandler};

/// 任务执行管理
///
/// 每个认领到的任务在独立的tokio任务中执行，`JoinHandle` 保存在运行表中，
/// 任务被取消或回收时直接中止。
pub struct TaskExecutionManager {
    worker_id: String,
    service: Arc<dyn TaskQueueService>,
    handler: Arc<dyn TaskHandler>,
    capacity: usize,
    running_tasks: Arc<RwLock<HashMap<TaskId, JoinHandle<()>>>>,
}

impl TaskExecutionManager {
    pub fn new(
        worker_id: String,
        service: Arc<dyn TaskQueueService>,
        handler: Arc<dyn TaskHandler>,
        capacity: usize,
    ) -> Self {
        Self {
            worker_id,
            service,
            handler,
            capacity,
            running_tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn running_task_ids(&self) -> Vec<TaskId> {
        let running_tasks = self.running_tasks.read().await;
        let mut ids: Vec<TaskId> = running_tasks.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn current_task_count(&self) -> usize {
        self.running_tasks.read().await.len()
    }

    pub async fn available_capacity(&self) -> usize {
        self.capacity
            .saturating_sub(self.current_task_count().await)
    }

    /// 启动一个已认领任务的执行
    pub async fn execute(&self, task: Task) {
        let task_id = task.id;
        let service = Arc::clone(&self.service);
        let handler = Arc::clone(&self.handler);
        let running_tasks = Arc::clone(&self.running_tasks);
        let worker_id = self.worker_id.clone();

        // 持有写锁期间插入句柄，保证执行结束时的移除一定发生在插入之后
        let mut running = self.running_tasks.write().await;
        if running.contains_key(&task_id) {
            warn!("任务 {} 已在本地执行中，忽略重复分配", task_id);
            return;
        }

        let handle = tokio::spawn(async move {
            Self::run_task(&worker_id, service.as_ref(), handler.as_ref(), &task).await;
            running_tasks.write().await.remove(&task_id);
        });
        running.insert(task_id, handle);
    }

    async fn run_task(
        worker_id: &str,
        service: &dyn TaskQueueService,
        handler: &dyn TaskHandler,
        task: &Task,
    ) {
        match service.report_start(worker_id, task.id, task.attempt).await {
            Ok(ReportAck::Stale) => {
                warn!("任务 {} 已不属于Worker {}，放弃执行", task.id, worker_id);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                // 结果上报会补记开始记录
                warn!("任务 {} 开始执行上报失败: {}", task.id, e);
            }
        }

        info!(
            "开始执行任务: task_id={}, priority={}, attempt={}, retries={}, timeout={}ms",
            task.id,
            task.priority,
            task.attempt,
            task.retry_count,
            task.timeout_ms
        );
        let execution_start = Instant::now();
        let outcome = into_outcome(handler.handle(task).await);
        let execution_duration = execution_start.elapsed();

        match service
            .report_result(worker_id, task.id, task.attempt, outcome)
            .await
        {
            Ok(ReportAck::Accepted) => {
                debug!("任务 {} 结果已上报，耗时 {:?}", task.id, execution_duration)
            }
            Ok(ack) => warn!("任务 {} 的结果上报被忽略: {:?}", task.id, ack),
            Err(e) => error!("任务 {} 结果上报失败: {}", task.id, e),
        }
    }

    /// 中止本地执行，任务不在运行表中时返回 false
    pub async fn abort(&self, task_id: TaskId) -> bool {
        let handle = self.running_tasks.write().await.remove(&task_id);
        match handle {
            Some(handle) => {
                handle.abort();
                info!("任务 {} 已在本地中止", task_id);
                true
            }
            None => {
                debug!("任务 {} 不在运行中，无需中止", task_id);
                false
            }
        }
    }

    /// 中止所有正在执行的任务，返回被中止的任务
    pub async fn abort_all(&self) -> Vec<TaskId> {
        let drained: Vec<(TaskId, JoinHandle<()>)> =
            self.running_tasks.write().await.drain().collect();
        let mut ids = Vec::with_capacity(drained.len());
        for (task_id, handle) in drained {
            handle.abort();
            ids.push(task_id);
        }
        if !ids.is_empty() {
            warn!("中止了 {} 个正在执行的任务", ids.len());
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskqueue_core::config::QueueConfig;
    use taskqueue_core::models::{
        QueueCounters, QueueStats, StateTransition, TaskOutcome, TaskPriority, TaskSubmission,
        WorkerInfo, WorkerRegistration, WorkerStats,
    };
    use taskqueue_core::traits::{HeartbeatAck, SubmitReceipt};
    use taskqueue_core::{SchedulerError, SchedulerResult};
    use tokio::sync::Mutex;

    use crate::handler::HandlerError;

    /// 只记录上报内容的服务桩
    #[derive(Default)]
    struct RecordingService {
        starts: AtomicUsize,
        results: Mutex<Vec<(TaskId, u32, TaskOutcome)>>,
    }

    #[async_trait]
    impl TaskQueueService for RecordingService {
        async fn submit(&self, _submission: TaskSubmission) -> SchedulerResult<SubmitReceipt> {
            Err(SchedulerError::Internal("unused".to_string()))
        }
        async fn get_status(&self, task_id: TaskId) -> SchedulerResult<Task> {
            Err(SchedulerError::TaskNotFound { id: task_id })
        }
        async fn cancel(&self, _task_id: TaskId, _reason: Option<String>) -> SchedulerResult<bool> {
            Ok(false)
        }
        async fn register_worker(
            &self,
            _registration: WorkerRegistration,
        ) -> SchedulerResult<WorkerInfo> {
            Err(SchedulerError::Internal("unused".to_string()))
        }
        async fn drain_worker(&self, worker_id: &str) -> SchedulerResult<WorkerInfo> {
            Err(SchedulerError::WorkerNotFound {
                id: worker_id.to_string(),
            })
        }
        async fn poll(&self, _worker_id: &str, _capacity: usize) -> SchedulerResult<Vec<Task>> {
            Ok(Vec::new())
        }
        async fn report_start(
            &self,
            _worker_id: &str,
            _task_id: TaskId,
            _attempt: u32,
        ) -> SchedulerResult<ReportAck> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(ReportAck::Accepted)
        }
        async fn report_result(
            &self,
            _worker_id: &str,
            task_id: TaskId,
            attempt: u32,
            outcome: TaskOutcome,
        ) -> SchedulerResult<ReportAck> {
            self.results.lock().await.push((task_id, attempt, outcome));
            Ok(ReportAck::Accepted)
        }
        async fn heartbeat(
            &self,
            _worker_id: &str,
            _running_tasks: &[TaskId],
        ) -> SchedulerResult<HeartbeatAck> {
            Ok(HeartbeatAck::default())
        }
        async fn replay_dead_letter(&self, task_id: TaskId) -> SchedulerResult<TaskId> {
            Ok(task_id)
        }
        async fn dead_letters(&self) -> SchedulerResult<Vec<Task>> {
            Ok(Vec::new())
        }
        async fn queue_stats(&self) -> SchedulerResult<QueueStats> {
            Ok(QueueStats::default())
        }
        async fn worker_stats(&self) -> SchedulerResult<Vec<WorkerStats>> {
            Ok(Vec::new())
        }
        async fn task_history(&self, _task_id: TaskId) -> SchedulerResult<Vec<StateTransition>> {
            Ok(Vec::new())
        }
        fn counters(&self) -> QueueCounters {
            QueueCounters::default()
        }
    }

    struct SleepyHandler;

    #[async_trait]
    impl TaskHandler for SleepyHandler {
        async fn handle(&self, task: &Task) -> Result<Option<serde_json::Value>, HandlerError> {
            if task.payload.get("hang").is_some() {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            }
            Err(HandlerError::retriable("flaky"))
        }
    }

    fn task(payload: serde_json::Value) -> Task {
        Task::from_submission(
            TaskSubmission::new(TaskPriority::High).with_payload(payload),
            &QueueConfig::default(),
            Utc::now(),
        )
    }

    async fn wait_until_idle(manager: &TaskExecutionManager) {
        for _ in 0..100 {
            if manager.current_task_count().await == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("tasks did not finish");
    }

    #[tokio::test]
    async fn test_execution_reports_start_and_result() {
        let service = Arc::new(RecordingService::default());
        let manager =
            TaskExecutionManager::new("w1".to_string(), service.clone(), Arc::new(SleepyHandler), 2);

        // 第二次被认领的任务，上报时回传同一个认领序号
        let mut task = task(serde_json::json!({}));
        task.attempt = 2;
        manager.execute(task.clone()).await;
        wait_until_idle(&manager).await;

        assert_eq!(service.starts.load(Ordering::SeqCst), 1);
        let results = service.results.lock().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], (task.id, 2, TaskOutcome::failure("flaky")));
        assert_eq!(manager.available_capacity().await, 2);
    }

    #[tokio::test]
    async fn test_abort_stops_execution_without_report() {
        let service = Arc::new(RecordingService::default());
        let manager =
            TaskExecutionManager::new("w1".to_string(), service.clone(), Arc::new(SleepyHandler), 2);

        let hung = task(serde_json::json!({"hang": true}));
        manager.execute(hung.clone()).await;
        assert_eq!(manager.running_task_ids().await, vec![hung.id]);
        assert_eq!(manager.available_capacity().await, 1);

        assert!(manager.abort(hung.id).await);
        assert!(!manager.abort(hung.id).await);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(service.results.lock().await.is_empty());

        manager.execute(task(serde_json::json!({"hang": true}))).await;
        manager.execute(task(serde_json::json!({"hang": true}))).await;
        assert_eq!(manager.abort_all().await.len(), 2);
        assert_eq!(manager.current_task_count().await, 0);
    }
}
