use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{
    QueueCounters, QueueStats, StateTransition, Task, TaskId, TaskOutcome, TaskSubmission,
    WorkerInfo, WorkerRegistration, WorkerStats,
};
use crate::SchedulerResult;

/// 提交回执
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub task_id: TaskId,
    /// 为 false 表示命中幂等键，未重复入队
    pub created: bool,
}

/// Worker上报的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportAck {
    Accepted,
    /// 重复上报，状态已经生效
    Duplicate,
    /// Worker已不再持有该任务，上报被忽略
    Stale,
}

/// 心跳回执
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// Worker上报在运行、但已被取消的任务，Worker应中止执行
    pub cancelled: Vec<TaskId>,
    /// Worker上报在运行、但所有权已被回收的任务
    pub revoked: Vec<TaskId>,
}

impl HeartbeatAck {
    pub fn is_empty(&self) -> bool {
        self.cancelled.is_empty() && self.revoked.is_empty()
    }

    pub fn tasks_to_abort(&self) -> impl Iterator<Item = &TaskId> {
        self.cancelled.iter().chain(self.revoked.iter())
    }
}

/// 任务队列服务接口
///
/// 调度核心对外暴露的全部操作。核心本身是被动的：每次Worker轮询和每个
/// 后台恢复任务都通过该接口驱动共享存储。
#[async_trait]
pub trait TaskQueueService: Send + Sync {
    /// 提交任务，有效期内的相同幂等键返回已有任务
    async fn submit(&self, submission: TaskSubmission) -> SchedulerResult<SubmitReceipt>;

    async fn get_status(&self, task_id: TaskId) -> SchedulerResult<Task>;

    /// 取消任务。任务已处于终态时返回 false
    async fn cancel(&self, task_id: TaskId, reason: Option<String>) -> SchedulerResult<bool>;

    async fn register_worker(&self, registration: WorkerRegistration)
        -> SchedulerResult<WorkerInfo>;

    /// 停止向Worker分配新任务，已持有的任务继续执行
    async fn drain_worker(&self, worker_id: &str) -> SchedulerResult<WorkerInfo>;

    /// 执行认领协议，返回最多 `available_capacity` 个已认领任务
    async fn poll(&self, worker_id: &str, available_capacity: usize) -> SchedulerResult<Vec<Task>>;

    /// 上报开始执行。`attempt` 为认领时任务携带的认领序号
    async fn report_start(
        &self,
        worker_id: &str,
        task_id: TaskId,
        attempt: u32,
    ) -> SchedulerResult<ReportAck>;

    /// 上报执行结果。来自更早一次认领的上报被判定为重复或过期
    async fn report_result(
        &self,
        worker_id: &str,
        task_id: TaskId,
        attempt: u32,
        outcome: TaskOutcome,
    ) -> SchedulerResult<ReportAck>;

    async fn heartbeat(
        &self,
        worker_id: &str,
        running_tasks: &[TaskId],
    ) -> SchedulerResult<HeartbeatAck>;

    /// 重放死信任务，返回新任务ID
    async fn replay_dead_letter(&self, task_id: TaskId) -> SchedulerResult<TaskId>;

    async fn dead_letters(&self) -> SchedulerResult<Vec<Task>>;

    async fn queue_stats(&self) -> SchedulerResult<QueueStats>;

    async fn worker_stats(&self) -> SchedulerResult<Vec<WorkerStats>>;

    async fn task_history(&self, task_id: TaskId) -> SchedulerResult<Vec<StateTransition>>;

    fn counters(&self) -> QueueCounters;
}
