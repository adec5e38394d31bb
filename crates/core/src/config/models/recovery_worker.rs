use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// 恢复扫描配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub heartbeat_interval_seconds: i64,
    /// 心跳超过 `间隔 × 该系数` 未更新即判定Worker不可达
    pub heartbeat_miss_factor: i64,
    pub heartbeat_scan_interval_seconds: u64,
    pub assignment_scan_interval_seconds: u64,
    pub task_timeout_scan_interval_seconds: u64,
    /// 判定认领超时、执行超时或心跳超时前额外容忍的时钟偏差
    pub clock_skew_allowance_ms: i64,
    pub health_probe_enabled: bool,
    pub health_probe_interval_seconds: u64,
    pub health_failure_threshold: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 10,
            heartbeat_miss_factor: 3,
            heartbeat_scan_interval_seconds: 5,
            assignment_scan_interval_seconds: 5,
            task_timeout_scan_interval_seconds: 10,
            clock_skew_allowance_ms: 2000,
            health_probe_enabled: false,
            health_probe_interval_seconds: 15,
            health_failure_threshold: 3,
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval_seconds <= 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.heartbeat_miss_factor <= 0 {
            return Err(anyhow::anyhow!("心跳丢失系数必须大于0"));
        }

        if self.heartbeat_scan_interval_seconds == 0
            || self.assignment_scan_interval_seconds == 0
            || self.task_timeout_scan_interval_seconds == 0
        {
            return Err(anyhow::anyhow!("扫描间隔必须大于0"));
        }

        if self.clock_skew_allowance_ms < 0 {
            return Err(anyhow::anyhow!("时钟偏差容忍不能为负数"));
        }

        if self.health_probe_enabled {
            if self.health_probe_interval_seconds == 0 {
                return Err(anyhow::anyhow!("健康探测间隔必须大于0"));
            }
            if self.health_failure_threshold == 0 {
                return Err(anyhow::anyhow!("健康探测失败阈值必须大于0"));
            }
        }

        Ok(())
    }

    /// 判定Worker不可达的心跳超时
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::seconds(self.heartbeat_interval_seconds * self.heartbeat_miss_factor)
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::milliseconds(self.clock_skew_allowance_ms)
    }

    pub fn heartbeat_scan_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.heartbeat_scan_interval_seconds)
    }

    pub fn assignment_scan_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.assignment_scan_interval_seconds)
    }

    pub fn task_timeout_scan_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.task_timeout_scan_interval_seconds)
    }

    pub fn health_probe_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.health_probe_interval_seconds)
    }
}

/// Worker代理配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 期望的Worker ID，为空时由调度器分配
    pub worker_id: Option<String>,
    pub hostname: Option<String>,
    pub capabilities: Vec<String>,
    pub capacity: u32,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            hostname: None,
            capabilities: vec!["default".to_string()],
            capacity: 4,
            poll_interval_ms: 500,
            heartbeat_interval_seconds: 10,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(id) = &self.worker_id {
            if id.trim().is_empty() {
                return Err(anyhow::anyhow!("Worker ID不能为空"));
            }
        }

        if self.capacity == 0 {
            return Err(anyhow::anyhow!("Worker容量必须大于0"));
        }

        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(anyhow::anyhow!("能力标签不能为空"));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("任务轮询间隔必须大于0"));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.heartbeat_interval_seconds)
    }
}
