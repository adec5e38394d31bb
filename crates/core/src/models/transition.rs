//! 任务状态机
//!
//! 所有状态变更都通过 [`Task::apply`] 完成。该函数是纯函数：不访问存储、不读时钟，
//! 存储层在自身的原子边界内调用它，再按结果更新索引和Worker负载。

use chrono::{DateTime, Duration, Utc};

use crate::models::{RetryDecision, RetryPolicy, Task, TaskId, TaskStatus, TransitionReason};

/// 对任务的一次状态变更请求
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// 队列中的任务被Worker认领，认领窗口到 `claim_until` 为止。认领序号加一
    Claim {
        worker_id: String,
        claim_until: DateTime<Utc>,
    },
    /// 认领后发现能力不匹配，退回队列并保留原始入队时间
    Release { worker_id: String },
    /// Worker开始执行
    ///
    /// Worker发起的转换都携带认领序号，只有与任务当前序号一致时才生效
    Start { worker_id: String, attempt: u32 },
    Complete {
        worker_id: String,
        attempt: u32,
        output: Option<serde_json::Value>,
    },
    Fail {
        worker_id: String,
        attempt: u32,
        error: String,
        retriable: bool,
        policy: RetryPolicy,
    },
    /// 回收任务。仅当任务仍处于 `expected` 状态且仍由 `worker_id` 的第 `attempt` 次认领持有时生效
    Recover {
        worker_id: String,
        attempt: u32,
        expected: TaskStatus,
        reason: TransitionReason,
        policy: RetryPolicy,
        progress: Option<f64>,
    },
    Cancel { reason: Option<String> },
    /// 死信任务已被重放为新任务
    MarkReplayed { new_task_id: TaskId },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Claim { .. } => "claim",
            Transition::Release { .. } => "release",
            Transition::Start { .. } => "start",
            Transition::Complete { .. } => "complete",
            Transition::Fail { .. } => "fail",
            Transition::Recover { .. } => "recover",
            Transition::Cancel { .. } => "cancel",
            Transition::MarkReplayed { .. } => "mark_replayed",
        }
    }
}

/// 转换被拒绝时的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoopKind {
    /// 重复请求，目标状态已经达成
    AlreadyApplied,
    /// 请求基于过期视图（所有权已转移、任务已终结等）
    Stale,
}

/// 转换成功后的附带信息
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    pub from: TaskStatus,
    /// 释放了持有该任务的Worker
    pub released_worker: Option<String>,
    /// 本次转换是一次归因于Worker的失败（显式失败或超时回收）
    pub failure: bool,
    pub retry: Option<RetryDecision>,
}

/// 已应用或被忽略的转换结果，携带转换后（或未变化）的任务快照
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied { task: Task, change: AppliedChange },
    Noop { task: Task, kind: NoopKind },
}

impl TransitionOutcome {
    pub fn task(&self) -> &Task {
        match self {
            TransitionOutcome::Applied { task, .. } | TransitionOutcome::Noop { task, .. } => task,
        }
    }

    pub fn into_task(self) -> Task {
        match self {
            TransitionOutcome::Applied { task, .. } | TransitionOutcome::Noop { task, .. } => task,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

impl Task {
    /// 应用一次状态转换
    ///
    /// 返回 `Err(NoopKind)` 时任务保持不变。重复的终态上报返回 `AlreadyApplied`，
    /// 来自已失去所有权的Worker的上报返回 `Stale`。
    pub fn apply(
        &mut self,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<AppliedChange, NoopKind> {
        let from = self.status;
        match transition {
            Transition::Claim {
                worker_id,
                claim_until,
            } => {
                if from != TaskStatus::Queued || !self.is_visible(now) {
                    return Err(NoopKind::Stale);
                }
                self.attempt = self.attempt.saturating_add(1);
                self.assigned_worker = Some(worker_id.clone());
                self.visible_until = Some(*claim_until);
                self.claimed_at = Some(now);
                self.record(
                    Some(from),
                    TaskStatus::Claimed,
                    TransitionReason::Claimed,
                    Some(worker_id.clone()),
                    None,
                    now,
                );
                Ok(self.change(from, None, false, None))
            }
            Transition::Release { worker_id } => {
                if from != TaskStatus::Claimed || !self.is_owned_by(worker_id) {
                    return Err(NoopKind::Stale);
                }
                self.clear_assignment();
                self.record(
                    Some(from),
                    TaskStatus::Queued,
                    TransitionReason::CapabilityMismatch,
                    Some(worker_id.clone()),
                    None,
                    now,
                );
                Ok(self.change(from, Some(worker_id.clone()), false, None))
            }
            Transition::Start { worker_id, attempt } => {
                if !self.is_held_by(worker_id, *attempt) {
                    return Err(NoopKind::Stale);
                }
                match from {
                    TaskStatus::Executing => Err(NoopKind::AlreadyApplied),
                    TaskStatus::Claimed => {
                        self.begin_execution(worker_id, now);
                        Ok(self.change(from, None, false, None))
                    }
                    _ => Err(NoopKind::Stale),
                }
            }
            Transition::Complete {
                worker_id,
                attempt,
                output,
            } => {
                if !self.is_held_by(worker_id, *attempt) {
                    let duplicate = from == TaskStatus::Completed
                        && self
                            .last_record_of_attempt(worker_id, *attempt)
                            .map_or(false, |r| r.to == TaskStatus::Completed);
                    return Err(if duplicate {
                        NoopKind::AlreadyApplied
                    } else {
                        NoopKind::Stale
                    });
                }
                if from == TaskStatus::Claimed {
                    // 开始执行的上报丢失或迟到时，补记一条开始记录
                    self.begin_execution(worker_id, now);
                } else if from != TaskStatus::Executing {
                    return Err(NoopKind::Stale);
                }
                self.clear_assignment();
                self.result = output.clone();
                self.finished_at = Some(now);
                self.record(
                    Some(TaskStatus::Executing),
                    TaskStatus::Completed,
                    TransitionReason::ExplicitResult,
                    Some(worker_id.clone()),
                    None,
                    now,
                );
                Ok(self.change(from, Some(worker_id.clone()), false, None))
            }
            Transition::Fail {
                worker_id,
                attempt,
                error,
                retriable,
                policy,
            } => {
                if !self.is_held_by(worker_id, *attempt) {
                    // 同一次认领的失败已经生效过，之后再次认领也不影响判定
                    let duplicate = self
                        .last_record_of_attempt(worker_id, *attempt)
                        .map_or(false, |r| {
                            r.to == TaskStatus::Failed
                                && r.detail.as_deref() == Some(error.as_str())
                        });
                    return Err(if duplicate {
                        NoopKind::AlreadyApplied
                    } else {
                        NoopKind::Stale
                    });
                }
                if from == TaskStatus::Claimed {
                    self.begin_execution(worker_id, now);
                } else if from != TaskStatus::Executing {
                    return Err(NoopKind::Stale);
                }
                let decision = policy.on_failure(self, *retriable);
                self.clear_assignment();
                self.last_error = Some(error.clone());
                self.record(
                    Some(TaskStatus::Executing),
                    TaskStatus::Failed,
                    TransitionReason::ExplicitResult,
                    Some(worker_id.clone()),
                    Some(error.clone()),
                    now,
                );
                self.settle_failure(TaskStatus::Failed, decision, now);
                Ok(self.change(from, Some(worker_id.clone()), true, Some(decision)))
            }
            Transition::Recover {
                worker_id,
                attempt,
                expected,
                reason,
                policy,
                progress,
            } => {
                if from != *expected || !from.is_owned() || !self.is_held_by(worker_id, *attempt) {
                    return Err(NoopKind::Stale);
                }
                let decision = policy.on_recovery(self, *progress);
                self.clear_assignment();
                self.last_error = Some(reason.as_str().to_string());
                self.record(
                    Some(from),
                    TaskStatus::Failed,
                    *reason,
                    Some(worker_id.clone()),
                    Some(reason.as_str().to_string()),
                    now,
                );
                self.settle_failure(TaskStatus::Failed, decision, now);
                Ok(self.change(from, Some(worker_id.clone()), true, Some(decision)))
            }
            Transition::Cancel { reason } => {
                if from == TaskStatus::Cancelled {
                    return Err(NoopKind::AlreadyApplied);
                }
                if from.is_terminal() {
                    return Err(NoopKind::Stale);
                }
                let released = self.assigned_worker.clone();
                self.clear_assignment();
                self.finished_at = Some(now);
                self.terminal_reason = reason.clone();
                self.record(
                    Some(from),
                    TaskStatus::Cancelled,
                    TransitionReason::Cancelled,
                    released.clone(),
                    reason.clone(),
                    now,
                );
                Ok(self.change(from, released, false, None))
            }
            Transition::MarkReplayed { new_task_id } => {
                if from != TaskStatus::DeadLetter {
                    return Err(NoopKind::Stale);
                }
                if self.replayed_as.is_some() {
                    return Err(NoopKind::AlreadyApplied);
                }
                self.replayed_as = Some(*new_task_id);
                self.record(
                    Some(from),
                    TaskStatus::DeadLetter,
                    TransitionReason::Replayed,
                    None,
                    Some(format!("replayed as {new_task_id}")),
                    now,
                );
                Ok(self.change(from, None, false, None))
            }
        }
    }

    /// 认领窗口是否已过期（含时钟偏差容忍）
    pub fn claim_expired(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.status == TaskStatus::Claimed
            && self.visible_until.map_or(false, |until| now >= add_or_max(until, skew))
    }

    /// 单次执行是否已超时（含宽限期）
    pub fn execution_expired(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.status == TaskStatus::Executing
            && self
                .visible_until
                .map_or(false, |deadline| now >= add_or_max(deadline, grace))
    }

    fn begin_execution(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.started_at = Some(now);
        self.visible_until = Some(add_or_max(now, self.timeout()));
        self.record(
            Some(TaskStatus::Claimed),
            TaskStatus::Executing,
            TransitionReason::Started,
            Some(worker_id.to_string()),
            None,
            now,
        );
    }

    fn clear_assignment(&mut self) {
        self.assigned_worker = None;
        self.visible_until = None;
        self.claimed_at = None;
    }

    /// 失败后的第二步：重新入队（保留原始优先级与入队时间）或进入死信
    fn settle_failure(&mut self, from: TaskStatus, decision: RetryDecision, now: DateTime<Utc>) {
        match decision {
            RetryDecision::Requeue {
                retry_count,
                timeout_ms,
                counted,
            } => {
                self.retry_count = retry_count;
                self.timeout_ms = timeout_ms;
                if !counted {
                    self.free_requeues = self.free_requeues.saturating_add(1);
                }
                self.started_at = None;
                self.record(
                    Some(from),
                    TaskStatus::Queued,
                    TransitionReason::RetryScheduled,
                    None,
                    Some(format!("retry {}/{}", self.retry_count, self.max_retries)),
                    now,
                );
            }
            RetryDecision::DeadLetter {
                retry_count,
                reason,
            } => {
                self.retry_count = retry_count;
                self.finished_at = Some(now);
                self.terminal_reason = Some(reason.as_str().to_string());
                self.record(Some(from), TaskStatus::DeadLetter, reason, None, None, now);
            }
        }
    }

    fn change(
        &self,
        from: TaskStatus,
        released_worker: Option<String>,
        failure: bool,
        retry: Option<RetryDecision>,
    ) -> AppliedChange {
        AppliedChange {
            from,
            released_worker,
            failure,
            retry,
        }
    }
}

fn add_or_max(at: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    at.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
