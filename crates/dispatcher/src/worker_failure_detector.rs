use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use taskqueue_core::{
    config::RecoveryConfig,
    models::{RetryPolicy, TransitionOutcome, TransitionReason, WorkerInfo, WorkerStatus, WorkerUpdate},
    traits::{QueueStore, UnreachableOutcome, WorkerRecovery},
    SchedulerResult,
};
use taskqueue_infrastructure::{MetricsCollector, StructuredLogger};

/// 主动健康探测
///
/// 与心跳相互独立的存活信号。探测失败只暂停向Worker分配新任务，
/// 不回收其正在执行的任务。
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, worker: &WorkerInfo) -> Result<(), String>;
}

/// 一次健康探测扫描的结果
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HealthScanReport {
    pub probed: usize,
    pub failed: Vec<String>,
    /// 本次扫描后处于暂停分配状态的Worker
    pub suspended: Vec<String>,
}

/// Worker失效检测服务接口
#[async_trait]
pub trait WorkerFailureDetectorService: Send + Sync {
    /// 检测心跳超时的Worker，标记为不可达并回收其任务
    async fn scan_heartbeats(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<UnreachableOutcome>>;

    /// 对所有未失联的Worker执行一次健康探测
    async fn scan_health(
        &self,
        probe: &dyn HealthProbe,
        now: DateTime<Utc>,
    ) -> SchedulerResult<HealthScanReport>;
}

/// Worker失效检测服务实现
pub struct WorkerFailureDetector {
    store: Arc<dyn QueueStore>,
    policy: RetryPolicy,
    heartbeat_timeout: Duration,
    clock_skew: Duration,
    health_failure_threshold: u32,
    metrics: Arc<MetricsCollector>,
}

impl WorkerFailureDetector {
    pub fn new(
        store: Arc<dyn QueueStore>,
        config: &RecoveryConfig,
        policy: RetryPolicy,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            policy,
            heartbeat_timeout: config.heartbeat_timeout(),
            clock_skew: config.clock_skew(),
            health_failure_threshold: config.health_failure_threshold,
            metrics,
        }
    }

    /// 检查Worker是否失效，心跳超时之外再容忍一个时钟偏差
    fn is_worker_failed(&self, worker: &WorkerInfo, now: DateTime<Utc>) -> bool {
        worker.status != WorkerStatus::Unreachable
            && worker.is_heartbeat_expired(now, self.heartbeat_timeout + self.clock_skew)
    }
}

/// 记录从某个Worker回收的任务
pub(crate) fn record_recovered(
    metrics: &MetricsCollector,
    worker_id: &str,
    reason: TransitionReason,
    recovered: &[TransitionOutcome],
) {
    for outcome in recovered {
        if let TransitionOutcome::Applied { task, change } = outcome {
            metrics.record_recovery(reason);
            StructuredLogger::log_task_recovered(task, worker_id, reason);
            if let Some(decision) = &change.retry {
                metrics.record_retry_decision(decision);
                StructuredLogger::log_retry_decision(task, decision);
            }
        }
    }
}

#[async_trait]
impl WorkerFailureDetectorService for WorkerFailureDetector {
    async fn scan_heartbeats(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<UnreachableOutcome>> {
        debug!("开始检测失效的Worker");

        let stale_before = now - self.heartbeat_timeout - self.clock_skew;
        let mut results = Vec::new();

        for worker in self.store.list_workers().await? {
            if !self.is_worker_failed(&worker, now) {
                continue;
            }
            warn!(
                "检测到失效Worker: {} (上次心跳: {})",
                worker.id,
                worker.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC")
            );

            let recovery = WorkerRecovery::new(TransitionReason::HeartbeatTimeout, self.policy);
            // 存储层会在同一个原子步骤内重新检查心跳，期间收到心跳则放弃
            match self
                .store
                .mark_worker_unreachable(&worker.id, stale_before, recovery, now)
                .await?
            {
                Some(outcome) => {
                    self.metrics.record_worker_unreachable();
                    record_recovered(
                        &self.metrics,
                        &worker.id,
                        TransitionReason::HeartbeatTimeout,
                        &outcome.recovered,
                    );
                    StructuredLogger::log_worker_unreachable(
                        &outcome.worker,
                        worker.last_heartbeat,
                        outcome.recovered.len(),
                    );
                    results.push(outcome);
                }
                None => debug!("Worker {} 在检测期间恢复了心跳", worker.id),
            }
        }

        if !results.is_empty() {
            info!("本轮共有 {} 个Worker被标记为不可达", results.len());
        }
        Ok(results)
    }

    async fn scan_health(
        &self,
        probe: &dyn HealthProbe,
        now: DateTime<Utc>,
    ) -> SchedulerResult<HealthScanReport> {
        let mut report = HealthScanReport::default();

        for worker in self.store.list_workers().await? {
            if worker.status == WorkerStatus::Unreachable {
                continue;
            }
            report.probed += 1;

            let result = probe.probe(&worker).await;
            let healthy = result.is_ok();
            if let Err(detail) = &result {
                warn!("Worker {} 健康探测失败: {}", worker.id, detail);
                report.failed.push(worker.id.clone());
            }

            let updated = self
                .store
                .update_worker(
                    &worker.id,
                    WorkerUpdate::HealthCheck {
                        healthy,
                        detail: result.err(),
                        failure_threshold: self.health_failure_threshold,
                    },
                    now,
                )
                .await?;

            if updated.assignments_suspended {
                if !worker.assignments_suspended {
                    error!(
                        "Worker {} 连续 {} 次健康探测失败，暂停分配新任务",
                        updated.id, updated.consecutive_health_failures
                    );
                }
                report.suspended.push(updated.id.clone());
            } else if worker.assignments_suspended {
                info!("Worker {} 健康探测恢复，重新开始分配任务", updated.id);
            }
        }

        Ok(report)
    }
}
