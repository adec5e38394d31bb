use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::errors::SchedulerError;
use crate::models::QueueEntry;

/// 单个任务允许配置的最大重试次数上限
pub const MAX_RETRIES_LIMIT: u32 = 100;
/// 幂等键最大长度
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;
/// 单次执行超时上限（7天）
pub const MAX_TIMEOUT_SECONDS: i64 = 7 * 24 * 3600;

/// 任务唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(TaskId)
            .map_err(|e| SchedulerError::invalid_params(format!("无效的任务ID {s}: {e}")))
    }
}

/// 任务优先级
///
/// 有序枚举，`High` 最紧急。排序分数由 [`crate::scoring::ScoreFunction`] 结合任务年龄计算。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 3] = [TaskPriority::High, TaskPriority::Medium, TaskPriority::Low];

    /// 优先级档位，0 为最高
    pub fn rank(self) -> i64 {
        match self {
            TaskPriority::High => 0,
            TaskPriority::Medium => 1,
            TaskPriority::Low => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(TaskPriority::High),
            1 => Some(TaskPriority::Medium),
            2 => Some(TaskPriority::Low),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::High => "high",
            TaskPriority::Medium => "medium",
            TaskPriority::Low => "low",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(TaskPriority::High),
            "medium" | "normal" => Ok(TaskPriority::Medium),
            "low" => Ok(TaskPriority::Low),
            _ => Err(SchedulerError::invalid_params(format!("无效的优先级: {s}"))),
        }
    }
}

/// 任务状态
///
/// ```text
/// queued → claimed → executing → completed
///    ↑        │           │
///    └────────┴── failed ─┴→ dead_letter
/// 任意非终态 → cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Claimed,
    Executing,
    Completed,
    Failed,
    Cancelled,
    DeadLetter,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::DeadLetter
        )
    }

    /// 处于优先级索引中的状态（排队中或认领后不可见）
    pub fn is_indexed(self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Claimed)
    }

    /// 被某个Worker持有的状态
    pub fn is_owned(self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Executing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Executing => "executing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "claimed" => Ok(TaskStatus::Claimed),
            "executing" => Ok(TaskStatus::Executing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "dead_letter" => Ok(TaskStatus::DeadLetter),
            _ => Err(SchedulerError::Serialization(format!("无效的任务状态: {s}"))),
        }
    }
}

/// 状态转换的触发原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    Submitted,
    Claimed,
    CapabilityMismatch,
    Started,
    ExplicitResult,
    HeartbeatTimeout,
    HealthCheckFailed,
    AssignmentTimeout,
    TaskTimeout,
    RetryScheduled,
    RetryExhausted,
    NonRetriable,
    Cancelled,
    Replayed,
    WorkerReregistered,
}

impl TransitionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionReason::Submitted => "submitted",
            TransitionReason::Claimed => "claimed",
            TransitionReason::CapabilityMismatch => "capability_mismatch",
            TransitionReason::Started => "started",
            TransitionReason::ExplicitResult => "explicit_result",
            TransitionReason::HeartbeatTimeout => "heartbeat_timeout",
            TransitionReason::HealthCheckFailed => "health_check_failed",
            TransitionReason::AssignmentTimeout => "assignment_timeout",
            TransitionReason::TaskTimeout => "task_timeout",
            TransitionReason::RetryScheduled => "retry_scheduled",
            TransitionReason::RetryExhausted => "retry_exhausted",
            TransitionReason::NonRetriable => "non_retriable",
            TransitionReason::Cancelled => "cancelled",
            TransitionReason::Replayed => "replayed",
            TransitionReason::WorkerReregistered => "worker_reregistered",
        }
    }
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务状态转换历史记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
    pub reason: TransitionReason,
    pub worker_id: Option<String>,
    pub detail: Option<String>,
    /// 记录发生时任务的认领序号
    #[serde(default)]
    pub attempt: u32,
}

/// Worker上报的执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success {
        output: Option<serde_json::Value>,
    },
    Failure {
        error: String,
        retriable: bool,
    },
}

impl TaskOutcome {
    pub fn success(output: Option<serde_json::Value>) -> Self {
        TaskOutcome::Success { output }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            error: error.into(),
            retriable: true,
        }
    }

    pub fn fatal(error: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            error: error.into(),
            retriable: false,
        }
    }
}

/// 任务提交请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub priority: TaskPriority,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// 单次执行超时（秒），为空时使用默认值
    pub timeout_seconds: Option<i64>,
    /// 最大重试次数，为空时使用默认值
    pub max_retries: Option<u32>,
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskSubmission {
    pub fn new(priority: TaskPriority) -> Self {
        Self {
            priority,
            capabilities: BTreeSet::new(),
            timeout_seconds: None,
            max_retries: None,
            idempotency_key: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: i64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// 在API边界同步校验，非法请求不会进入队列
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if let Some(timeout) = self.timeout_seconds {
            if timeout <= 0 {
                return Err(SchedulerError::invalid_params(format!(
                    "超时时间必须大于0，实际为 {timeout}"
                )));
            }
            if timeout > MAX_TIMEOUT_SECONDS {
                return Err(SchedulerError::invalid_params(format!(
                    "超时时间不能超过 {MAX_TIMEOUT_SECONDS} 秒，实际为 {timeout}"
                )));
            }
        }

        if let Some(max_retries) = self.max_retries {
            if max_retries > MAX_RETRIES_LIMIT {
                return Err(SchedulerError::invalid_params(format!(
                    "最大重试次数不能超过 {MAX_RETRIES_LIMIT}，实际为 {max_retries}"
                )));
            }
        }

        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(SchedulerError::invalid_params("能力标签不能为空"));
        }

        if let Some(key) = &self.idempotency_key {
            if key.trim().is_empty() {
                return Err(SchedulerError::invalid_params("幂等键不能为空"));
            }
            if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(SchedulerError::invalid_params(format!(
                    "幂等键长度不能超过 {MAX_IDEMPOTENCY_KEY_LEN}"
                )));
            }
        }

        Ok(())
    }
}

/// 任务登记记录
///
/// 任务的权威状态。`assigned_worker` 非空时 `visible_until` 必然非空：
/// 认领阶段表示认领窗口的到期时间，执行阶段表示本次执行的截止时间。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub priority: TaskPriority,
    pub capabilities: BTreeSet<String>,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// 认领序号，每次认领加一。Worker上报时必须回传，用于识别过期的上报
    #[serde(default)]
    pub attempt: u32,
    /// 因“几乎未执行”而免计重试次数的重新入队次数
    pub free_requeues: u32,
    pub base_timeout_ms: i64,
    /// 当前单次执行超时，重试时按退避倍数增长
    pub timeout_ms: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub assigned_worker: Option<String>,
    pub visible_until: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub idempotency_expires_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub terminal_reason: Option<String>,
    pub replay_of: Option<TaskId>,
    pub replayed_as: Option<TaskId>,
    pub history: Vec<StateTransition>,
}

impl Task {
    /// 根据提交请求创建任务，缺省字段取队列配置中的默认值
    pub fn from_submission(
        submission: TaskSubmission,
        config: &QueueConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let timeout_ms = submission
            .timeout_seconds
            .unwrap_or(config.default_timeout_seconds)
            .saturating_mul(1000);
        let idempotency_expires_at = submission
            .idempotency_key
            .as_ref()
            .map(|_| now + Duration::seconds(config.idempotency_window_seconds));

        let mut task = Self {
            id: TaskId::new(),
            priority: submission.priority,
            capabilities: submission.capabilities,
            payload: submission.payload,
            status: TaskStatus::Queued,
            retry_count: 0,
            max_retries: submission.max_retries.unwrap_or(config.default_max_retries),
            attempt: 0,
            free_requeues: 0,
            base_timeout_ms: timeout_ms,
            timeout_ms,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            started_at: None,
            finished_at: None,
            assigned_worker: None,
            visible_until: None,
            idempotency_key: submission.idempotency_key,
            idempotency_expires_at,
            result: None,
            last_error: None,
            terminal_reason: None,
            replay_of: None,
            replayed_as: None,
            history: Vec::new(),
        };
        task.record(None, TaskStatus::Queued, TransitionReason::Submitted, None, None, now);
        task
    }

    /// 从死信任务创建重放任务：新ID、重试计数归零、保留原始优先级和配置
    pub fn replay_from(original: &Task, now: DateTime<Utc>) -> Self {
        let mut task = Self {
            id: TaskId::new(),
            priority: original.priority,
            capabilities: original.capabilities.clone(),
            payload: original.payload.clone(),
            status: TaskStatus::Queued,
            retry_count: 0,
            max_retries: original.max_retries,
            attempt: 0,
            free_requeues: 0,
            base_timeout_ms: original.base_timeout_ms,
            timeout_ms: original.base_timeout_ms,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            started_at: None,
            finished_at: None,
            assigned_worker: None,
            visible_until: None,
            idempotency_key: None,
            idempotency_expires_at: None,
            result: None,
            last_error: None,
            terminal_reason: None,
            replay_of: Some(original.id),
            replayed_as: None,
            history: Vec::new(),
        };
        task.record(
            None,
            TaskStatus::Queued,
            TransitionReason::Replayed,
            None,
            Some(format!("replay of {}", original.id)),
            now,
        );
        task
    }

    pub fn timeout(&self) -> Duration {
        Duration::milliseconds(self.timeout_ms)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 队列条目仅在 `now >= visible_until` 时可被认领
    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.visible_until.map_or(true, |until| now >= until)
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.assigned_worker.as_deref() == Some(worker_id)
    }

    /// 任务当前由该Worker的第 `attempt` 次认领持有
    pub fn is_held_by(&self, worker_id: &str, attempt: u32) -> bool {
        self.is_owned_by(worker_id) && self.attempt == attempt
    }

    /// 幂等键在 `now` 时刻是否仍然有效
    pub fn idempotency_valid(&self, now: DateTime<Utc>) -> bool {
        self.idempotency_key.is_some()
            && self.idempotency_expires_at.map_or(false, |expires| now < expires)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).max(Duration::zero())
    }

    pub fn queue_entry(&self) -> QueueEntry {
        QueueEntry {
            task_id: self.id,
            priority: self.priority,
            created_at: self.created_at,
            visible_until: self.visible_until,
            status: self.status,
        }
    }

    /// 该Worker在第 `attempt` 次认领期间的最后一条历史记录
    pub fn last_record_of_attempt(
        &self,
        worker_id: &str,
        attempt: u32,
    ) -> Option<&StateTransition> {
        self.history.iter().rev().find(|record| {
            record.attempt == attempt && record.worker_id.as_deref() == Some(worker_id)
        })
    }

    pub fn last_transition(&self) -> Option<&StateTransition> {
        self.history.last()
    }

    pub(crate) fn record(
        &mut self,
        from: Option<TaskStatus>,
        to: TaskStatus,
        reason: TransitionReason,
        worker_id: Option<String>,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.status = to;
        self.updated_at = now;
        self.history.push(StateTransition {
            from,
            to,
            at: now,
            reason,
            worker_id,
            detail,
            attempt: self.attempt,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_parse_and_order() {
        assert_eq!("HIGH".parse::<TaskPriority>().unwrap(), TaskPriority::High);
        assert_eq!("normal".parse::<TaskPriority>().unwrap(), TaskPriority::Medium);
        assert!("urgent".parse::<TaskPriority>().is_err());
        assert!(TaskPriority::High < TaskPriority::Low);
        assert_eq!(TaskPriority::from_rank(2), Some(TaskPriority::Low));
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&TaskStatus::DeadLetter).unwrap();
        assert_eq!(json, "\"dead_letter\"");
        assert_eq!("dead_letter".parse::<TaskStatus>().unwrap(), TaskStatus::DeadLetter);
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_submission_validation() {
        assert!(TaskSubmission::new(TaskPriority::Low).validate().is_ok());
        assert!(TaskSubmission::new(TaskPriority::Low)
            .with_timeout_seconds(0)
            .validate()
            .is_err());
        assert!(TaskSubmission::new(TaskPriority::Low)
            .with_timeout_seconds(-5)
            .validate()
            .is_err());
        assert!(TaskSubmission::new(TaskPriority::Low)
            .with_timeout_seconds(MAX_TIMEOUT_SECONDS)
            .validate()
            .is_ok());
        assert!(matches!(
            TaskSubmission::new(TaskPriority::Low)
                .with_timeout_seconds(i64::MAX)
                .validate(),
            Err(SchedulerError::InvalidTaskParams(_))
        ));
        assert!(TaskSubmission::new(TaskPriority::Low)
            .with_max_retries(MAX_RETRIES_LIMIT + 1)
            .validate()
            .is_err());
        assert!(TaskSubmission::new(TaskPriority::Low)
            .with_capabilities(["gpu", " "])
            .validate()
            .is_err());
        assert!(TaskSubmission::new(TaskPriority::Low)
            .with_idempotency_key("")
            .validate()
            .is_err());
    }

    #[test]
    fn test_from_submission_applies_defaults() {
        let config = QueueConfig::default();
        let now = Utc::now();
        let task = Task::from_submission(
            TaskSubmission::new(TaskPriority::High).with_idempotency_key("order-42"),
            &config,
            now,
        );

        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.max_retries, config.default_max_retries);
        assert_eq!(task.timeout_ms, config.default_timeout_seconds * 1000);
        assert!(task.idempotency_valid(now));
        assert!(!task.idempotency_valid(
            now + Duration::seconds(config.idempotency_window_seconds)
        ));
        assert_eq!(task.history.len(), 1);
        assert_eq!(task.history[0].reason, TransitionReason::Submitted);
        assert!(task.is_visible(now));
    }

    #[test]
    fn test_task_id_roundtrip() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<TaskId>().is_err());
    }
}
