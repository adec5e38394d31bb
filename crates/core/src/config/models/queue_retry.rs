use serde::{Deserialize, Serialize};

use crate::models::{MAX_RETRIES_LIMIT, MAX_TIMEOUT_SECONDS};

/// 优先级队列与认领协议配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 相邻优先级档位之间的分数差（秒），即低一档任务追平所需的等待时间
    pub priority_gap_seconds: i64,
    /// 最长等待时间，超过后强制提升到最高档
    pub max_wait_seconds: i64,
    /// 认领窗口，Worker需在此时间内上报开始执行
    pub claim_window_seconds: i64,
    /// 每次轮询读取 `容量 × 超额系数` 个候选条目
    pub oversubscribe_factor: usize,
    /// 单次轮询的最大认领轮数
    pub max_claim_rounds: usize,
    pub idempotency_window_seconds: i64,
    pub default_timeout_seconds: i64,
    pub default_max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            priority_gap_seconds: 60,
            max_wait_seconds: 1800, // 30分钟
            claim_window_seconds: 30,
            oversubscribe_factor: 2,
            max_claim_rounds: 3,
            idempotency_window_seconds: 86400, // 24小时
            default_timeout_seconds: 300,
            default_max_retries: 3,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.priority_gap_seconds <= 0 {
            return Err(anyhow::anyhow!("优先级间隔必须大于0"));
        }

        if self.max_wait_seconds <= 0 {
            return Err(anyhow::anyhow!("最长等待时间必须大于0"));
        }

        if self.claim_window_seconds <= 0 {
            return Err(anyhow::anyhow!("认领窗口必须大于0"));
        }

        if self.oversubscribe_factor == 0 {
            return Err(anyhow::anyhow!("超额认领系数必须大于0"));
        }

        if self.max_claim_rounds == 0 {
            return Err(anyhow::anyhow!("最大认领轮数必须大于0"));
        }

        if self.idempotency_window_seconds <= 0 {
            return Err(anyhow::anyhow!("幂等窗口必须大于0"));
        }

        if self.default_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("默认任务超时必须大于0"));
        }

        if self.default_timeout_seconds > MAX_TIMEOUT_SECONDS {
            return Err(anyhow::anyhow!(
                "默认任务超时不能超过 {} 秒",
                MAX_TIMEOUT_SECONDS
            ));
        }

        if self.default_max_retries > MAX_RETRIES_LIMIT {
            return Err(anyhow::anyhow!(
                "默认最大重试次数不能超过 {}",
                MAX_RETRIES_LIMIT
            ));
        }

        Ok(())
    }
}

/// 重试与死信策略配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 每次计数重试后单次超时的放大倍数
    pub timeout_backoff_multiplier: f64,
    pub timeout_ceiling_seconds: i64,
    /// 执行超时时进度低于该比例视为几乎未执行
    pub marginal_progress_fraction: f64,
    /// 单个任务允许的免计数重新入队次数
    pub max_free_requeues: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            timeout_backoff_multiplier: 1.5,
            timeout_ceiling_seconds: 3600,
            marginal_progress_fraction: 0.1,
            max_free_requeues: 1,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeout_backoff_multiplier.is_nan() || self.timeout_backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!(
                "超时退避倍数不能小于1: {}",
                self.timeout_backoff_multiplier
            ));
        }

        if self.timeout_ceiling_seconds <= 0 {
            return Err(anyhow::anyhow!("超时上限必须大于0"));
        }

        if !(0.0..1.0).contains(&self.marginal_progress_fraction) {
            return Err(anyhow::anyhow!(
                "进度阈值必须位于 [0, 1) 区间: {}",
                self.marginal_progress_fraction
            ));
        }

        Ok(())
    }
}
