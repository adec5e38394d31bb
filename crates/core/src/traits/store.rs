//! 队列存储接口定义
//!
//! `QueueStore` 是优先级索引、任务登记表和Worker登记表的唯一原子边界。
//! 每个方法都是一个不可分割的操作：“从索引中取出”与“标记为已认领”不会被
//! 并发的另一个调用者观察为两个独立步骤。
//!
//! 实现：
//! - 内存实现：单个互斥锁保护索引和登记表（单实例部署、测试）
//! - SQLite 实现：每个操作一个数据库事务

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    ClaimOutcome, InsertOutcome, QueueEntry, RetryPolicy, Task, TaskId, TaskStatus, Transition,
    TransitionOutcome, TransitionReason, WorkerInfo, WorkerRegistration, WorkerUpdate,
};
use crate::SchedulerResult;

/// 回收Worker所持有任务时使用的参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerRecovery {
    pub reason: TransitionReason,
    pub policy: RetryPolicy,
}

impl WorkerRecovery {
    pub fn new(reason: TransitionReason, policy: RetryPolicy) -> Self {
        Self { reason, policy }
    }

    /// 以相同ID重新注册时回收旧实例持有的任务
    pub fn reregistered(policy: RetryPolicy) -> Self {
        Self::new(TransitionReason::WorkerReregistered, policy)
    }
}

/// 注册Worker的结果
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationOutcome {
    pub worker: WorkerInfo,
    /// 旧实例遗留、在注册时被回收的任务
    pub recovered: Vec<TransitionOutcome>,
}

/// 将Worker标记为不可达的结果
#[derive(Debug, Clone, PartialEq)]
pub struct UnreachableOutcome {
    pub worker: WorkerInfo,
    /// 被回收的任务（已重新入队或进入死信）
    pub recovered: Vec<TransitionOutcome>,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// 原子地检查幂等键、写入登记表并加入索引
    async fn insert_task(&self, task: Task, now: DateTime<Utc>) -> SchedulerResult<InsertOutcome>;

    async fn get_task(&self, id: TaskId) -> SchedulerResult<Option<Task>>;

    async fn tasks_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>>;

    async fn tasks_owned_by(&self, worker_id: &str) -> SchedulerResult<Vec<Task>>;

    async fn list_tasks(&self) -> SchedulerResult<Vec<Task>>;

    /// 读取任务、应用纯状态转换、写回并维护索引和Worker负载
    async fn apply_transition(
        &self,
        id: TaskId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> SchedulerResult<TransitionOutcome>;

    /// 按生效顺序返回最多 `limit` 个当前可见的排队条目
    async fn peek_visible(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        exclude: &HashSet<TaskId>,
    ) -> SchedulerResult<Vec<QueueEntry>>;

    /// 原子认领：Worker可分配且未满、任务仍为可见的排队状态时才成功
    async fn claim(
        &self,
        id: TaskId,
        worker_id: &str,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
    ) -> SchedulerResult<ClaimOutcome>;

    /// 索引中的全部条目（排队中与已认领）
    async fn queued_entries(&self) -> SchedulerResult<Vec<QueueEntry>>;

    /// 注册Worker。指定的ID已存在时以相同身份重新激活
    ///
    /// 重新注册意味着旧实例已经重启，它持有的任务在同一原子操作内按 `recovery` 回收，
    /// 新实例从零负载开始。
    async fn register_worker(
        &self,
        registration: WorkerRegistration,
        recovery: WorkerRecovery,
        now: DateTime<Utc>,
    ) -> SchedulerResult<RegistrationOutcome>;

    async fn get_worker(&self, id: &str) -> SchedulerResult<Option<WorkerInfo>>;

    async fn list_workers(&self) -> SchedulerResult<Vec<WorkerInfo>>;

    async fn update_worker(
        &self,
        id: &str,
        update: WorkerUpdate,
        now: DateTime<Utc>,
    ) -> SchedulerResult<WorkerInfo>;

    /// 原子地复核心跳是否早于 `stale_before`，回收其全部任务并标记为不可达
    ///
    /// Worker已不可达或心跳已刷新时返回 `None`。
    async fn mark_worker_unreachable(
        &self,
        id: &str,
        stale_before: DateTime<Utc>,
        recovery: WorkerRecovery,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<UnreachableOutcome>>;

    /// 后端存储是否可达
    async fn ping(&self) -> SchedulerResult<()>;
}
