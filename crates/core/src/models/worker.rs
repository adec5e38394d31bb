use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SchedulerError;
use crate::models::TaskId;

/// Worker节点信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub hostname: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub capacity: u32,
    /// 持有的 claimed/executing 任务数，由存储层维护
    pub load: u32,
    /// 最近一次心跳自报的运行任务数，仅用于观测
    pub reported_load: u32,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub last_health_check: Option<HealthCheckRecord>,
    pub consecutive_health_failures: u32,
    /// 健康探测连续失败后暂停分配新任务，已持有的任务不受影响
    pub assignments_suspended: bool,
    pub recent_failures: u32,
    pub unreachable_reason: Option<String>,
    pub unreachable_at: Option<DateTime<Utc>>,
}

/// Worker状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Draining,
    Unreachable,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Draining => "draining",
            WorkerStatus::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WorkerStatus::Active),
            "draining" => Ok(WorkerStatus::Draining),
            "unreachable" => Ok(WorkerStatus::Unreachable),
            _ => Err(SchedulerError::Serialization(format!("无效的Worker状态: {s}"))),
        }
    }
}

/// 健康探测记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckRecord {
    pub at: DateTime<Utc>,
    pub healthy: bool,
    pub detail: Option<String>,
}

/// Worker注册请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    /// 期望使用的ID，用于重启后以相同身份重新注册
    pub worker_id: Option<String>,
    pub hostname: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub capacity: u32,
}

impl WorkerRegistration {
    pub fn new(capacity: u32) -> Self {
        Self {
            worker_id: None,
            hostname: None,
            capabilities: BTreeSet::new(),
            capacity,
        }
    }

    pub fn with_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.capacity == 0 {
            return Err(SchedulerError::invalid_params("Worker容量必须大于0"));
        }
        if let Some(id) = &self.worker_id {
            if id.trim().is_empty() {
                return Err(SchedulerError::invalid_params("Worker ID不能为空"));
            }
        }
        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(SchedulerError::invalid_params("能力标签不能为空"));
        }
        Ok(())
    }
}

/// Worker心跳信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    /// Worker本地正在处理的任务
    pub running_tasks: Vec<TaskId>,
}

/// 对Worker记录的原子更新
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerUpdate {
    Heartbeat {
        reported_load: u32,
    },
    HealthCheck {
        healthy: bool,
        detail: Option<String>,
        failure_threshold: u32,
    },
    Drain,
}

impl WorkerInfo {
    /// 创建新的Worker信息
    pub fn new(id: String, registration: WorkerRegistration, now: DateTime<Utc>) -> Self {
        Self {
            id,
            hostname: registration.hostname,
            capabilities: registration.capabilities,
            capacity: registration.capacity,
            load: 0,
            reported_load: 0,
            status: WorkerStatus::Active,
            last_heartbeat: now,
            registered_at: now,
            last_health_check: None,
            consecutive_health_failures: 0,
            assignments_suspended: false,
            recent_failures: 0,
            unreachable_reason: None,
            unreachable_at: None,
        }
    }

    /// 以相同ID重新注册，恢复为可分配状态并更新能力和容量
    ///
    /// 旧实例持有的任务必须已由存储层回收，新实例从零负载开始。
    pub fn reactivate(&mut self, registration: WorkerRegistration, now: DateTime<Utc>) {
        self.hostname = registration.hostname.or(self.hostname.take());
        self.capabilities = registration.capabilities;
        self.capacity = registration.capacity;
        self.reported_load = 0;
        self.status = WorkerStatus::Active;
        self.last_heartbeat = now;
        self.consecutive_health_failures = 0;
        self.assignments_suspended = false;
        self.recent_failures = 0;
        self.unreachable_reason = None;
        self.unreachable_at = None;
    }

    /// 检查Worker是否可以接受新任务
    pub fn accepts_new_tasks(&self) -> bool {
        self.status == WorkerStatus::Active && !self.assignments_suspended
    }

    pub fn free_slots(&self) -> u32 {
        self.capacity.saturating_sub(self.load)
    }

    /// 任务要求的能力是否为Worker能力的子集
    pub fn supports(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// 获取Worker负载率
    pub fn load_percentage(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            (self.load as f64 / self.capacity as f64) * 100.0
        }
    }

    /// 检查心跳是否超时
    pub fn is_heartbeat_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_heartbeat > timeout
    }

    pub fn apply_update(
        &mut self,
        update: &WorkerUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        match update {
            WorkerUpdate::Heartbeat { reported_load } => {
                if self.status == WorkerStatus::Unreachable {
                    return Err(SchedulerError::WorkerUnavailable {
                        id: self.id.clone(),
                        reason: "已被标记为不可达，需要重新注册".to_string(),
                    });
                }
                self.last_heartbeat = now;
                self.reported_load = *reported_load;
            }
            WorkerUpdate::HealthCheck {
                healthy,
                detail,
                failure_threshold,
            } => {
                if self.status == WorkerStatus::Unreachable {
                    return Ok(());
                }
                self.last_health_check = Some(HealthCheckRecord {
                    at: now,
                    healthy: *healthy,
                    detail: detail.clone(),
                });
                if *healthy {
                    self.consecutive_health_failures = 0;
                    self.assignments_suspended = false;
                } else {
                    self.consecutive_health_failures += 1;
                    if self.consecutive_health_failures >= *failure_threshold {
                        self.assignments_suspended = true;
                    }
                }
            }
            WorkerUpdate::Drain => match self.status {
                WorkerStatus::Active | WorkerStatus::Draining => {
                    self.status = WorkerStatus::Draining;
                }
                WorkerStatus::Unreachable => {
                    return Err(SchedulerError::WorkerUnavailable {
                        id: self.id.clone(),
                        reason: "已被标记为不可达".to_string(),
                    });
                }
            },
        }
        Ok(())
    }

    pub fn mark_unreachable(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = WorkerStatus::Unreachable;
        self.unreachable_reason = Some(reason.into());
        self.unreachable_at = Some(now);
    }
}
