use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskqueue_core::models::{
    ClaimOutcome, InsertOutcome, QueueEntry, Task, TaskId, TaskStatus, Transition,
    TransitionOutcome, WorkerInfo, WorkerRegistration, WorkerStatus, WorkerUpdate,
};
use taskqueue_core::traits::{QueueStore, RegistrationOutcome, UnreachableOutcome, WorkerRecovery};
use taskqueue_core::{SchedulerError, SchedulerResult, ScoreFunction};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 内存队列存储
///
/// 单个互斥锁同时保护优先级索引、任务登记表和Worker登记表，
/// 每个操作在一次加锁内完成，适用于单实例部署和测试。
#[derive(Debug)]
pub struct InMemoryQueueStore {
    state: Mutex<StoreState>,
    scorer: ScoreFunction,
    /// 故障注入开关，关闭后所有操作返回存储不可用
    available: AtomicBool,
}

#[derive(Debug, Default)]
struct StoreState {
    tasks: HashMap<TaskId, Task>,
    /// 未提升任务的排序：(排序键, 入队毫秒, 任务ID)
    index: BTreeSet<(i64, i64, TaskId)>,
    /// 按入队时间排序，用于找出已被强制提升的任务
    by_created: BTreeSet<(i64, TaskId)>,
    idempotency: HashMap<String, TaskId>,
    workers: HashMap<String, WorkerInfo>,
    owned: HashMap<String, HashSet<TaskId>>,
}

impl StoreState {
    fn sync_index(&mut self, scorer: &ScoreFunction, task: &Task) {
        let created_ms = task.created_at.timestamp_millis();
        let key = (
            scorer.ordering_key(task.priority, task.created_at),
            created_ms,
            task.id,
        );
        if task.status.is_indexed() {
            self.index.insert(key);
            self.by_created.insert((created_ms, task.id));
        } else {
            self.index.remove(&key);
            self.by_created.remove(&(created_ms, task.id));
        }
    }

    fn sync_owner(&mut self, task: &Task, released: Option<&str>) {
        if let Some(worker_id) = released {
            if let Some(owned) = self.owned.get_mut(worker_id) {
                owned.remove(&task.id);
            }
        }
        if let Some(worker_id) = &task.assigned_worker {
            self.owned
                .entry(worker_id.clone())
                .or_default()
                .insert(task.id);
        }
    }

    fn load_of(&self, worker_id: &str) -> u32 {
        self.owned.get(worker_id).map_or(0, |owned| owned.len() as u32)
    }

    fn worker_snapshot(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.workers.get(worker_id).map(|worker| {
            let mut worker = worker.clone();
            worker.load = self.load_of(worker_id);
            worker
        })
    }

    fn record_failure(&mut self, worker_id: &str) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.recent_failures = worker.recent_failures.saturating_add(1);
        }
    }

    /// 在已持有锁的前提下应用状态转换并维护索引、所有权和失败计数
    fn apply(
        &mut self,
        scorer: &ScoreFunction,
        id: TaskId,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> SchedulerResult<TransitionOutcome> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(SchedulerError::TaskNotFound { id })?;

        match task.apply(transition, now) {
            Ok(change) => {
                let task = task.clone();
                self.sync_index(scorer, &task);
                self.sync_owner(&task, change.released_worker.as_deref());
                if change.failure {
                    if let Some(worker_id) = &change.released_worker {
                        self.record_failure(worker_id);
                    }
                }
                Ok(TransitionOutcome::Applied { task, change })
            }
            Err(kind) => Ok(TransitionOutcome::Noop {
                task: task.clone(),
                kind,
            }),
        }
    }

    /// 回收Worker持有的全部任务，返回实际生效的回收结果
    fn recover_owned(
        &mut self,
        scorer: &ScoreFunction,
        worker_id: &str,
        recovery: WorkerRecovery,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<TransitionOutcome>> {
        let mut owned: Vec<TaskId> = self
            .owned
            .get(worker_id)
            .map(|owned| owned.iter().copied().collect())
            .unwrap_or_default();
        owned.sort();

        let mut recovered = Vec::with_capacity(owned.len());
        for task_id in owned {
            let Some((expected, attempt)) = self
                .tasks
                .get(&task_id)
                .map(|task| (task.status, task.attempt))
            else {
                continue;
            };
            let transition = Transition::Recover {
                worker_id: worker_id.to_string(),
                attempt,
                expected,
                reason: recovery.reason,
                policy: recovery.policy,
                progress: None,
            };
            let outcome = self.apply(scorer, task_id, &transition, now)?;
            if outcome.is_applied() {
                recovered.push(outcome);
            }
        }
        self.owned.remove(worker_id);
        Ok(recovered)
    }
}

impl InMemoryQueueStore {
    pub fn new(scorer: ScoreFunction) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            scorer,
            available: AtomicBool::new(true),
        }
    }

    /// 从登记表快照重建存储，索引完全由任务记录推导
    pub fn from_snapshot(scorer: ScoreFunction, tasks: Vec<Task>, workers: Vec<WorkerInfo>) -> Self {
        let mut state = StoreState::default();
        for worker in workers {
            state.workers.insert(worker.id.clone(), worker);
        }
        for task in tasks {
            state.sync_index(&scorer, &task);
            state.sync_owner(&task, None);
            if let Some(key) = &task.idempotency_key {
                state.idempotency.insert(key.clone(), task.id);
            }
            state.tasks.insert(task.id, task);
        }

        info!(
            tasks = state.tasks.len(),
            indexed = state.index.len(),
            workers = state.workers.len(),
            "从快照重建内存存储"
        );

        Self {
            state: Mutex::new(state),
            scorer,
            available: AtomicBool::new(true),
        }
    }

    /// 导出全部任务和Worker记录
    pub async fn snapshot(&self) -> (Vec<Task>, Vec<WorkerInfo>) {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let workers = state
            .workers
            .keys()
            .filter_map(|id| state.worker_snapshot(id))
            .collect();
        (tasks, workers)
    }

    pub fn set_available(&self, available: bool) {
        if !available {
            warn!("内存存储被设置为不可用");
        }
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> SchedulerResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SchedulerError::StoreUnavailable(
                "内存存储当前不可用".to_string(),
            ))
        }
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn insert_task(&self, task: Task, now: DateTime<Utc>) -> SchedulerResult<InsertOutcome> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;

        if let Some(key) = &task.idempotency_key {
            if let Some(existing) = state
                .idempotency
                .get(key)
                .and_then(|id| state.tasks.get(id))
                .filter(|existing| existing.idempotency_valid(now))
            {
                debug!(task_id = %existing.id, idempotency_key = %key, "幂等键命中，返回已存在的任务");
                return Ok(InsertOutcome {
                    task: existing.clone(),
                    created: false,
                });
            }
            state.idempotency.insert(key.clone(), task.id);
        }

        state.sync_index(&self.scorer, &task);
        state.tasks.insert(task.id, task.clone());
        Ok(InsertOutcome {
            task,
            created: true,
        })
    }

    async fn get_task(&self, id: TaskId) -> SchedulerResult<Option<Task>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.tasks.get(&id).cloned())
    }

    async fn tasks_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|task| task.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn tasks_owned_by(&self, worker_id: &str) -> SchedulerResult<Vec<Task>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .owned
            .get(worker_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.tasks.get(id))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn list_tasks(&self) -> SchedulerResult<Vec<Task>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn apply_transition(
        &self,
        id: TaskId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> SchedulerResult<TransitionOutcome> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        state.apply(&self.scorer, id, &transition, now)
    }

    async fn peek_visible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        exclude: &HashSet<TaskId>,
    ) -> SchedulerResult<Vec<QueueEntry>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let cutoff_ms = self.scorer.promotion_cutoff(now).timestamp_millis();
        let mut entries = Vec::with_capacity(limit);

        let visible = |id: &TaskId| {
            state
                .tasks
                .get(id)
                .filter(|task| task.status == TaskStatus::Queued && task.is_visible(now))
                .map(Task::queue_entry)
        };

        // 已提升的任务按入队时间排在最前
        for (created_ms, id) in &state.by_created {
            if entries.len() >= limit || *created_ms > cutoff_ms {
                break;
            }
            if exclude.contains(id) {
                continue;
            }
            if let Some(entry) = visible(id) {
                entries.push(entry);
            }
        }

        for (_, created_ms, id) in &state.index {
            if entries.len() >= limit {
                break;
            }
            if *created_ms <= cutoff_ms || exclude.contains(id) {
                continue;
            }
            if let Some(entry) = visible(id) {
                entries.push(entry);
            }
        }

        Ok(entries)
    }

    async fn claim(
        &self,
        id: TaskId,
        worker_id: &str,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
    ) -> SchedulerResult<ClaimOutcome> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;

        let worker = state
            .workers
            .get(worker_id)
            .ok_or_else(|| SchedulerError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;
        if !worker.accepts_new_tasks() {
            let reason = if worker.assignments_suspended {
                "健康探测失败，暂停分配".to_string()
            } else {
                format!("状态为 {}", worker.status)
            };
            return Ok(ClaimOutcome::WorkerUnavailable(reason));
        }
        if state.load_of(worker_id) >= worker.capacity {
            return Ok(ClaimOutcome::WorkerFull);
        }
        if !state.tasks.contains_key(&id) {
            return Ok(ClaimOutcome::Lost);
        }

        let transition = Transition::Claim {
            worker_id: worker_id.to_string(),
            claim_until,
        };
        match state.apply(&self.scorer, id, &transition, now)? {
            TransitionOutcome::Applied { task, .. } => Ok(ClaimOutcome::Claimed(task)),
            TransitionOutcome::Noop { .. } => Ok(ClaimOutcome::Lost),
        }
    }

    async fn queued_entries(&self) -> SchedulerResult<Vec<QueueEntry>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .index
            .iter()
            .filter_map(|(_, _, id)| state.tasks.get(id))
            .map(Task::queue_entry)
            .collect())
    }

    async fn register_worker(
        &self,
        registration: WorkerRegistration,
        recovery: WorkerRecovery,
        now: DateTime<Utc>,
    ) -> SchedulerResult<RegistrationOutcome> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let id = registration
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4().simple()));

        let mut recovered = Vec::new();
        if let Some(previous_status) = state.workers.get(&id).map(|worker| worker.status) {
            recovered = state.recover_owned(&self.scorer, &id, recovery, now)?;
            info!(
                worker_id = %id,
                previous_status = %previous_status,
                recovered = recovered.len(),
                "Worker重新注册"
            );
            if let Some(existing) = state.workers.get_mut(&id) {
                existing.reactivate(registration, now);
            }
        } else {
            state
                .workers
                .insert(id.clone(), WorkerInfo::new(id.clone(), registration, now));
        }

        let worker = state
            .worker_snapshot(&id)
            .ok_or_else(|| SchedulerError::Internal(format!("注册后找不到Worker {id}")))?;
        Ok(RegistrationOutcome { worker, recovered })
    }

    async fn get_worker(&self, id: &str) -> SchedulerResult<Option<WorkerInfo>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state.worker_snapshot(id))
    }

    async fn list_workers(&self) -> SchedulerResult<Vec<WorkerInfo>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let mut workers: Vec<WorkerInfo> = state
            .workers
            .keys()
            .filter_map(|id| state.worker_snapshot(id))
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    async fn update_worker(
        &self,
        id: &str,
        update: WorkerUpdate,
        now: DateTime<Utc>,
    ) -> SchedulerResult<WorkerInfo> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let worker = state
            .workers
            .get_mut(id)
            .ok_or_else(|| SchedulerError::WorkerNotFound { id: id.to_string() })?;
        worker.apply_update(&update, now)?;
        state
            .worker_snapshot(id)
            .ok_or_else(|| SchedulerError::WorkerNotFound { id: id.to_string() })
    }

    async fn mark_worker_unreachable(
        &self,
        id: &str,
        stale_before: DateTime<Utc>,
        recovery: WorkerRecovery,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<UnreachableOutcome>> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;

        let worker = state
            .workers
            .get(id)
            .ok_or_else(|| SchedulerError::WorkerNotFound { id: id.to_string() })?;
        if worker.status == WorkerStatus::Unreachable
            || worker.last_heartbeat >= stale_before
        {
            return Ok(None);
        }

        let recovered = state.recover_owned(&self.scorer, id, recovery, now)?;

        let worker = state
            .workers
            .get_mut(id)
            .ok_or_else(|| SchedulerError::WorkerNotFound { id: id.to_string() })?;
        worker.mark_unreachable(recovery.reason.as_str(), now);

        let worker = state
            .worker_snapshot(id)
            .ok_or_else(|| SchedulerError::WorkerNotFound { id: id.to_string() })?;
        Ok(Some(UnreachableOutcome { worker, recovered }))
    }

    async fn ping(&self) -> SchedulerResult<()> {
        self.ensure_available()
    }
}
