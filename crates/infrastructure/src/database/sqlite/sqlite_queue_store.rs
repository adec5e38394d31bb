use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use taskqueue_core::config::StoreConfig;
use taskqueue_core::models::{
    ClaimOutcome, InsertOutcome, QueueEntry, Task, TaskId, TaskStatus, Transition,
    TransitionOutcome, WorkerInfo, WorkerRegistration, WorkerStatus, WorkerUpdate,
};
use taskqueue_core::traits::{QueueStore, RegistrationOutcome, UnreachableOutcome, WorkerRecovery};
use taskqueue_core::{SchedulerError, SchedulerResult, ScoreFunction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::database::mapping::MappingHelpers;

const SCHEMA: [&str; 6] = [
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        priority_rank INTEGER NOT NULL,
        created_at_ms INTEGER NOT NULL,
        sort_key INTEGER NOT NULL,
        visible_until_ms INTEGER,
        worker_id TEXT,
        idempotency_key TEXT,
        idempotency_expires_ms INTEGER,
        body TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_queue ON tasks (status, sort_key, created_at_ms, id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks (status, created_at_ms, id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_worker ON tasks (worker_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_idempotency ON tasks (idempotency_key)",
    r#"
    CREATE TABLE IF NOT EXISTS workers (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        last_heartbeat_ms INTEGER NOT NULL,
        body TEXT NOT NULL
    )
    "#,
];

const WORKER_SELECT: &str = r#"
    SELECT w.body AS body,
           (SELECT COUNT(*) FROM tasks t WHERE t.worker_id = w.id) AS load
    FROM workers w
"#;

/// SQLite队列存储
///
/// 连接池只有一个连接，每个操作在一个事务内完成，写入天然串行化。
/// 优先级索引就是 `tasks` 表上的 `(status, sort_key)` 索引，冷启动无需重建。
pub struct SqliteQueueStore {
    pool: SqlitePool,
    scorer: ScoreFunction,
}

impl SqliteQueueStore {
    pub async fn connect(config: &StoreConfig, scorer: ScoreFunction) -> SchedulerResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(&config.sqlite_url)
            .await?;

        let store = Self::with_pool(pool, scorer);
        store.migrate().await?;
        let rekeyed = store.rekey().await?;
        if rekeyed > 0 {
            info!(rekeyed, "优先级间隔与上次运行不同，已重算排序键");
        }
        info!(url = %config.sqlite_url, "SQLite队列存储已就绪");
        Ok(store)
    }

    pub fn with_pool(pool: SqlitePool, scorer: ScoreFunction) -> Self {
        Self { pool, scorer }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> SchedulerResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// 按当前评分函数重算索引内任务的排序键，返回被更新的行数
    pub async fn rekey(&self) -> SchedulerResult<u64> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT body FROM tasks WHERE status IN ('queued', 'claimed')")
            .fetch_all(&mut *tx)
            .await?;

        let mut updated = 0;
        for row in &rows {
            let task = MappingHelpers::task_from_row(row)?;
            let key = self.scorer.ordering_key(task.priority, task.created_at);
            updated += sqlx::query("UPDATE tasks SET sort_key = ? WHERE id = ? AND sort_key <> ?")
                .bind(key)
                .bind(task.id.to_string())
                .bind(key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn load_task(conn: &mut SqliteConnection, id: TaskId) -> SchedulerResult<Option<Task>> {
        let row = sqlx::query("SELECT body FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(MappingHelpers::task_from_row).transpose()
    }

    async fn save_task(
        conn: &mut SqliteConnection,
        scorer: &ScoreFunction,
        task: &Task,
    ) -> SchedulerResult<()> {
        let body = MappingHelpers::to_json(task)?;
        sqlx::query(
            r#"
            INSERT INTO tasks (id, status, priority_rank, created_at_ms, sort_key, visible_until_ms,
                               worker_id, idempotency_key, idempotency_expires_ms, body)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                sort_key = excluded.sort_key,
                visible_until_ms = excluded.visible_until_ms,
                worker_id = excluded.worker_id,
                body = excluded.body
            "#,
        )
        .bind(task.id.to_string())
        .bind(task.status.as_str())
        .bind(task.priority.rank())
        .bind(MappingHelpers::millis(task.created_at))
        .bind(scorer.ordering_key(task.priority, task.created_at))
        .bind(MappingHelpers::optional_millis(task.visible_until))
        .bind(task.assigned_worker.as_deref())
        .bind(task.idempotency_key.as_deref())
        .bind(MappingHelpers::optional_millis(task.idempotency_expires_at))
        .bind(body)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn load_worker(
        conn: &mut SqliteConnection,
        id: &str,
    ) -> SchedulerResult<Option<WorkerInfo>> {
        let sql = format!("{WORKER_SELECT} WHERE w.id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(MappingHelpers::worker_from_row).transpose()
    }

    async fn require_worker(conn: &mut SqliteConnection, id: &str) -> SchedulerResult<WorkerInfo> {
        Self::load_worker(conn, id)
            .await?
            .ok_or_else(|| SchedulerError::WorkerNotFound { id: id.to_string() })
    }

    async fn save_worker(conn: &mut SqliteConnection, worker: &WorkerInfo) -> SchedulerResult<()> {
        let body = MappingHelpers::to_json(worker)?;
        sqlx::query(
            r#"
            INSERT INTO workers (id, status, last_heartbeat_ms, body)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                last_heartbeat_ms = excluded.last_heartbeat_ms,
                body = excluded.body
            "#,
        )
        .bind(&worker.id)
        .bind(worker.status.as_str())
        .bind(MappingHelpers::millis(worker.last_heartbeat))
        .bind(body)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn fetch_tasks(
        conn: &mut SqliteConnection,
        sql: &str,
        bind: Option<&str>,
    ) -> SchedulerResult<Vec<Task>> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&mut *conn).await?;
        rows.iter().map(MappingHelpers::task_from_row).collect()
    }

    /// 在调用方的事务内应用状态转换
    async fn apply_in(
        conn: &mut SqliteConnection,
        scorer: &ScoreFunction,
        id: TaskId,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> SchedulerResult<TransitionOutcome> {
        let mut task = Self::load_task(conn, id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id })?;

        match task.apply(transition, now) {
            Ok(change) => {
                Self::save_task(conn, scorer, &task).await?;
                if change.failure {
                    if let Some(worker_id) = &change.released_worker {
                        if let Some(mut worker) = Self::load_worker(conn, worker_id).await? {
                            worker.recent_failures = worker.recent_failures.saturating_add(1);
                            Self::save_worker(conn, &worker).await?;
                        }
                    }
                }
                Ok(TransitionOutcome::Applied { task, change })
            }
            Err(kind) => Ok(TransitionOutcome::Noop { task, kind }),
        }
    }

    /// 在调用方的事务内回收Worker持有的全部任务
    async fn recover_owned_in(
        conn: &mut SqliteConnection,
        scorer: &ScoreFunction,
        worker_id: &str,
        recovery: WorkerRecovery,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<TransitionOutcome>> {
        let owned = Self::fetch_tasks(
            conn,
            "SELECT body FROM tasks WHERE worker_id = ? ORDER BY id",
            Some(worker_id),
        )
        .await?;

        let mut recovered = Vec::with_capacity(owned.len());
        for task in owned {
            let transition = Transition::Recover {
                worker_id: worker_id.to_string(),
                attempt: task.attempt,
                expected: task.status,
                reason: recovery.reason,
                policy: recovery.policy,
                progress: None,
            };
            let outcome = Self::apply_in(conn, scorer, task.id, &transition, now).await?;
            if outcome.is_applied() {
                recovered.push(outcome);
            }
        }
        Ok(recovered)
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn insert_task(&self, task: Task, now: DateTime<Utc>) -> SchedulerResult<InsertOutcome> {
        let mut tx = self.pool.begin().await?;

        if let Some(key) = &task.idempotency_key {
            let existing = sqlx::query(
                r#"
                SELECT body FROM tasks
                WHERE idempotency_key = ? AND idempotency_expires_ms > ?
                ORDER BY created_at_ms DESC
                LIMIT 1
                "#,
            )
            .bind(key)
            .bind(MappingHelpers::millis(now))
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                let existing = MappingHelpers::task_from_row(&row)?;
                debug!(task_id = %existing.id, idempotency_key = %key, "幂等键命中，返回已存在的任务");
                return Ok(InsertOutcome {
                    task: existing,
                    created: false,
                });
            }
        }

        Self::save_task(&mut tx, &self.scorer, &task).await?;
        tx.commit().await?;
        Ok(InsertOutcome {
            task,
            created: true,
        })
    }

    async fn get_task(&self, id: TaskId) -> SchedulerResult<Option<Task>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_task(&mut conn, id).await
    }

    async fn tasks_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_tasks(
            &mut conn,
            "SELECT body FROM tasks WHERE status = ? ORDER BY created_at_ms, id",
            Some(status.as_str()),
        )
        .await
    }

    async fn tasks_owned_by(&self, worker_id: &str) -> SchedulerResult<Vec<Task>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_tasks(
            &mut conn,
            "SELECT body FROM tasks WHERE worker_id = ? ORDER BY created_at_ms, id",
            Some(worker_id),
        )
        .await
    }

    async fn list_tasks(&self) -> SchedulerResult<Vec<Task>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_tasks(
            &mut conn,
            "SELECT body FROM tasks ORDER BY created_at_ms, id",
            None,
        )
        .await
    }

    async fn apply_transition(
        &self,
        id: TaskId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> SchedulerResult<TransitionOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = Self::apply_in(&mut tx, &self.scorer, id, &transition, now).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn peek_visible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        exclude: &HashSet<TaskId>,
    ) -> SchedulerResult<Vec<QueueEntry>> {
        let mut conn = self.pool.acquire().await?;
        let cutoff_ms = MappingHelpers::millis(self.scorer.promotion_cutoff(now));
        let now_ms = MappingHelpers::millis(now);
        let fetch = i64::try_from(limit + exclude.len()).unwrap_or(i64::MAX);

        // 已提升的任务按入队时间排在最前
        let promoted = sqlx::query(
            r#"
            SELECT body FROM tasks
            WHERE status = 'queued' AND created_at_ms <= ?
              AND (visible_until_ms IS NULL OR visible_until_ms <= ?)
            ORDER BY created_at_ms, id
            LIMIT ?
            "#,
        )
        .bind(cutoff_ms)
        .bind(now_ms)
        .bind(fetch)
        .fetch_all(&mut *conn)
        .await?;

        let regular = sqlx::query(
            r#"
            SELECT body FROM tasks
            WHERE status = 'queued' AND created_at_ms > ?
              AND (visible_until_ms IS NULL OR visible_until_ms <= ?)
            ORDER BY sort_key, created_at_ms, id
            LIMIT ?
            "#,
        )
        .bind(cutoff_ms)
        .bind(now_ms)
        .bind(fetch)
        .fetch_all(&mut *conn)
        .await?;

        let mut entries = Vec::with_capacity(limit);
        for row in promoted.iter().chain(regular.iter()) {
            if entries.len() >= limit {
                break;
            }
            let task = MappingHelpers::task_from_row(row)?;
            if !exclude.contains(&task.id) {
                entries.push(task.queue_entry());
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
        let mut tx = self.pool.begin().await?;

        let worker = Self::require_worker(&mut tx, worker_id).await?;
        if !worker.accepts_new_tasks() {
            let reason = if worker.assignments_suspended {
                "健康探测失败，暂停分配".to_string()
            } else {
                format!("状态为 {}", worker.status)
            };
            return Ok(ClaimOutcome::WorkerUnavailable(reason));
        }
        if worker.load >= worker.capacity {
            return Ok(ClaimOutcome::WorkerFull);
        }
        if Self::load_task(&mut tx, id).await?.is_none() {
            return Ok(ClaimOutcome::Lost);
        }

        let transition = Transition::Claim {
            worker_id: worker_id.to_string(),
            claim_until,
        };
        let outcome = Self::apply_in(&mut tx, &self.scorer, id, &transition, now).await?;
        tx.commit().await?;

        Ok(match outcome {
            TransitionOutcome::Applied { task, .. } => ClaimOutcome::Claimed(task),
            TransitionOutcome::Noop { .. } => ClaimOutcome::Lost,
        })
    }

    async fn queued_entries(&self) -> SchedulerResult<Vec<QueueEntry>> {
        let mut conn = self.pool.acquire().await?;
        let tasks = Self::fetch_tasks(
            &mut conn,
            "SELECT body FROM tasks WHERE status IN ('queued', 'claimed') ORDER BY sort_key, created_at_ms, id",
            None,
        )
        .await?;
        Ok(tasks.iter().map(Task::queue_entry).collect())
    }

    async fn register_worker(
        &self,
        registration: WorkerRegistration,
        recovery: WorkerRecovery,
        now: DateTime<Utc>,
    ) -> SchedulerResult<RegistrationOutcome> {
        let mut tx = self.pool.begin().await?;
        let id = registration
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4().simple()));

        let mut recovered = Vec::new();
        let worker = match Self::load_worker(&mut tx, &id).await? {
            Some(previous) => {
                recovered =
                    Self::recover_owned_in(&mut tx, &self.scorer, &id, recovery, now).await?;
                info!(
                    worker_id = %id,
                    previous_status = %previous.status,
                    recovered = recovered.len(),
                    "Worker重新注册"
                );
                // 回收会更新失败计数，重新读取后再激活
                let mut existing = Self::require_worker(&mut tx, &id).await?;
                existing.reactivate(registration, now);
                existing
            }
            None => WorkerInfo::new(id.clone(), registration, now),
        };
        Self::save_worker(&mut tx, &worker).await?;
        let worker = Self::require_worker(&mut tx, &id).await?;
        tx.commit().await?;
        Ok(RegistrationOutcome { worker, recovered })
    }

    async fn get_worker(&self, id: &str) -> SchedulerResult<Option<WorkerInfo>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_worker(&mut conn, id).await
    }

    async fn list_workers(&self) -> SchedulerResult<Vec<WorkerInfo>> {
        let sql = format!("{WORKER_SELECT} ORDER BY w.id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(MappingHelpers::worker_from_row).collect()
    }

    async fn update_worker(
        &self,
        id: &str,
        update: WorkerUpdate,
        now: DateTime<Utc>,
    ) -> SchedulerResult<WorkerInfo> {
        let mut tx = self.pool.begin().await?;
        let mut worker = Self::require_worker(&mut tx, id).await?;
        worker.apply_update(&update, now)?;
        Self::save_worker(&mut tx, &worker).await?;
        tx.commit().await?;
        Ok(worker)
    }

    async fn mark_worker_unreachable(
        &self,
        id: &str,
        stale_before: DateTime<Utc>,
        recovery: WorkerRecovery,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<UnreachableOutcome>> {
        let mut tx = self.pool.begin().await?;

        let worker = Self::require_worker(&mut tx, id).await?;
        if worker.status == WorkerStatus::Unreachable || worker.last_heartbeat >= stale_before {
            return Ok(None);
        }

        let recovered = Self::recover_owned_in(&mut tx, &self.scorer, id, recovery, now).await?;

        let mut worker = Self::require_worker(&mut tx, id).await?;
        worker.mark_unreachable(recovery.reason.as_str(), now);
        Self::save_worker(&mut tx, &worker).await?;
        let worker = Self::require_worker(&mut tx, id).await?;
        tx.commit().await?;

        Ok(Some(UnreachableOutcome { worker, recovered }))
    }

    async fn ping(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use taskqueue_core::config::QueueConfig;
    use taskqueue_core::models::{RetryPolicy, TaskPriority, TaskSubmission, TransitionReason};

    use super::*;

    fn scorer() -> ScoreFunction {
        ScoreFunction::new(ChronoDuration::seconds(60), ChronoDuration::seconds(300))
    }

    async fn memory_store() -> SqliteQueueStore {
        let config = StoreConfig {
            sqlite_url: "sqlite::memory:".to_string(),
            ..StoreConfig::default()
        };
        SqliteQueueStore::connect(&config, scorer()).await.unwrap()
    }

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn task(priority: TaskPriority, now: DateTime<Utc>) -> Task {
        Task::from_submission(TaskSubmission::new(priority), &QueueConfig::default(), now)
    }

    #[tokio::test]
    async fn test_insert_and_peek_order() {
        let store = memory_store().await;
        let now = start();
        let low = task(TaskPriority::Low, now);
        let high = task(TaskPriority::High, now + ChronoDuration::seconds(1));
        store.insert_task(low.clone(), now).await.unwrap();
        store.insert_task(high.clone(), now).await.unwrap();

        let peeked = store
            .peek_visible(now + ChronoDuration::seconds(2), 10, &HashSet::new())
            .await
            .unwrap();
        let ids: Vec<_> = peeked.iter().map(|e| e.task_id).collect();
        assert_eq!(ids, vec![high.id, low.id]);

        let loaded = store.get_task(low.id).await.unwrap().unwrap();
        assert_eq!(loaded, low);
    }

    #[tokio::test]
    async fn test_claim_and_recover_in_transactions() {
        let store = memory_store().await;
        let now = start();
        let worker = store
            .register_worker(
                WorkerRegistration::new(1).with_id("w1"),
                WorkerRecovery::reregistered(RetryPolicy::default()),
                now,
            )
            .await
            .unwrap()
            .worker;
        assert_eq!(worker.load, 0);

        let a = task(TaskPriority::Medium, now);
        let b = task(TaskPriority::Medium, now);
        store.insert_task(a.clone(), now).await.unwrap();
        store.insert_task(b.clone(), now).await.unwrap();

        let until = now + ChronoDuration::seconds(30);
        assert!(matches!(
            store.claim(a.id, "w1", now, until).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        assert_eq!(
            store.claim(b.id, "w1", now, until).await.unwrap(),
            ClaimOutcome::WorkerFull
        );
        assert_eq!(store.tasks_owned_by("w1").await.unwrap().len(), 1);

        let later = now + ChronoDuration::seconds(60);
        let outcome = store
            .mark_worker_unreachable(
                "w1",
                later - ChronoDuration::seconds(30),
                WorkerRecovery {
                    reason: TransitionReason::HeartbeatTimeout,
                    policy: RetryPolicy::default(),
                },
                later,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.recovered.len(), 1);
        assert_eq!(outcome.worker.status, WorkerStatus::Unreachable);
        assert_eq!(outcome.worker.load, 0);
        assert_eq!(outcome.worker.recent_failures, 1);

        let requeued = store.get_task(a.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Queued);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.created_at, a.created_at);
    }

    #[tokio::test]
    async fn test_idempotency_key_lookup() {
        let store = memory_store().await;
        let now = start();
        let submission = TaskSubmission::new(TaskPriority::High).with_idempotency_key("order-1");
        let first = Task::from_submission(submission.clone(), &QueueConfig::default(), now);
        let second = Task::from_submission(submission, &QueueConfig::default(), now);

        assert!(store.insert_task(first.clone(), now).await.unwrap().created);
        let deduped = store.insert_task(second, now).await.unwrap();
        assert!(!deduped.created);
        assert_eq!(deduped.task.id, first.id);
        assert_eq!(store.list_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let config = StoreConfig {
            backend: taskqueue_core::config::StoreBackend::Sqlite,
            sqlite_url: format!("sqlite://{}?mode=rwc", path.display()),
            ..StoreConfig::default()
        };
        let now = start();
        let queued = task(TaskPriority::Low, now);

        {
            let store = SqliteQueueStore::connect(&config, scorer()).await.unwrap();
            store.insert_task(queued.clone(), now).await.unwrap();
            store.close().await;
        }

        let reopened = SqliteQueueStore::connect(&config, scorer()).await.unwrap();
        let entries = reopened.queued_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task_id, queued.id);
        assert!(reopened.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_reopen_with_new_priority_gap_rekeys_queue() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            backend: taskqueue_core::config::StoreBackend::Sqlite,
            sqlite_url: format!("sqlite://{}?mode=rwc", dir.path().join("queue.db").display()),
            ..StoreConfig::default()
        };
        let now = start();
        let low = task(TaskPriority::Low, now);
        let high = task(TaskPriority::High, now + ChronoDuration::seconds(90));

        {
            let store = SqliteQueueStore::connect(&config, scorer()).await.unwrap();
            store.insert_task(low.clone(), now).await.unwrap();
            store.insert_task(high.clone(), now).await.unwrap();
            store.close().await;
        }

        // 间隔从60秒缩小到10秒后，提前90秒入队的低优先级任务排在前面
        let narrow = ScoreFunction::new(ChronoDuration::seconds(10), ChronoDuration::seconds(300));
        let reopened = SqliteQueueStore::connect(&config, narrow).await.unwrap();
        let peeked = reopened
            .peek_visible(now + ChronoDuration::seconds(91), 10, &HashSet::new())
            .await
            .unwrap();
        let ids: Vec<_> = peeked.iter().map(|e| e.task_id).collect();
        assert_eq!(ids, vec![low.id, high.id]);
        assert_eq!(reopened.rekey().await.unwrap(), 0);
    }
}
