use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::models::{Task, TransitionReason};

/// 失败或超时后的重试策略
///
/// 由配置构造，作为状态转换的参数传入存储层，保证重试判定与状态写入在同一个原子步骤内完成。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub timeout_backoff_multiplier: f64,
    pub timeout_ceiling_ms: i64,
    /// 执行进度低于该比例的超时视为“几乎未执行”
    pub marginal_progress_fraction: f64,
    pub max_free_requeues: u32,
}

/// 重试判定结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    Requeue {
        retry_count: u32,
        timeout_ms: i64,
        /// 为 false 表示本次重新入队不计入重试次数
        counted: bool,
    },
    DeadLetter {
        retry_count: u32,
        reason: TransitionReason,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            timeout_backoff_multiplier: config.timeout_backoff_multiplier,
            timeout_ceiling_ms: config.timeout_ceiling_seconds.saturating_mul(1000),
            marginal_progress_fraction: config.marginal_progress_fraction,
            max_free_requeues: config.max_free_requeues,
        }
    }

    /// 下一次执行的超时时间，不超过上限
    pub fn next_timeout_ms(&self, current_ms: i64) -> i64 {
        let grown = (current_ms as f64 * self.timeout_backoff_multiplier).round() as i64;
        grown.max(current_ms).min(self.timeout_ceiling_ms.max(current_ms))
    }

    /// Worker显式上报失败
    pub fn on_failure(&self, task: &Task, retriable: bool) -> RetryDecision {
        let retry_count = task.retry_count.saturating_add(1);
        if !retriable {
            return RetryDecision::DeadLetter {
                retry_count,
                reason: TransitionReason::NonRetriable,
            };
        }
        self.counted(task, retry_count)
    }

    /// 恢复扫描回收的任务。`progress` 为执行进度比例，仅执行超时扫描会提供
    pub fn on_recovery(&self, task: &Task, progress: Option<f64>) -> RetryDecision {
        if let Some(progress) = progress {
            if progress < self.marginal_progress_fraction
                && task.free_requeues < self.max_free_requeues
            {
                return RetryDecision::Requeue {
                    retry_count: task.retry_count,
                    timeout_ms: task.timeout_ms,
                    counted: false,
                };
            }
        }
        self.counted(task, task.retry_count.saturating_add(1))
    }

    fn counted(&self, task: &Task, retry_count: u32) -> RetryDecision {
        if retry_count > task.max_retries {
            RetryDecision::DeadLetter {
                retry_count,
                reason: TransitionReason::RetryExhausted,
            }
        } else {
            RetryDecision::Requeue {
                retry_count,
                timeout_ms: self.next_timeout_ms(task.timeout_ms),
                counted: true,
            }
        }
    }
}
