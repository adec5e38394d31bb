//! 恢复监督器
//!
//! 四个相互独立的周期任务，只通过共享存储通信：
//! 心跳扫描、认领超时扫描、执行超时扫描以及可选的健康探测扫描。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use taskqueue_core::{
    config::{AppConfig, RecoveryConfig},
    models::{RetryPolicy, TaskStatus, TransitionOutcome},
    traits::{Clock, QueueStore},
    SchedulerResult,
};
use taskqueue_infrastructure::{MetricsCollector, StructuredLogger};

use crate::recovery_service::{RecoveryReport, RecoveryService, TaskRecoveryService};
use crate::worker_failure_detector::{
    HealthProbe, HealthScanReport, WorkerFailureDetector, WorkerFailureDetectorService,
};

/// 所有扫描各执行一次的汇总
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SupervisorReport {
    pub unreachable_workers: Vec<String>,
    pub heartbeat: RecoveryReport,
    pub assignment: RecoveryReport,
    pub task_timeout: RecoveryReport,
    pub health: Option<HealthScanReport>,
}

impl SupervisorReport {
    pub fn recovered(&self) -> usize {
        self.heartbeat.recovered() + self.assignment.recovered() + self.task_timeout.recovered()
    }
}

pub struct RecoverySupervisor {
    detector: Arc<WorkerFailureDetector>,
    recovery: Arc<TaskRecoveryService>,
    probe: Option<Arc<dyn HealthProbe>>,
    clock: Arc<dyn Clock>,
    config: RecoveryConfig,
}

impl RecoverySupervisor {
    pub fn new(
        store: Arc<dyn QueueStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
        config: &AppConfig,
    ) -> Self {
        let policy = RetryPolicy::from_config(&config.retry);
        Self {
            detector: Arc::new(WorkerFailureDetector::new(
                store.clone(),
                &config.recovery,
                policy,
                metrics.clone(),
            )),
            recovery: Arc::new(TaskRecoveryService::new(
                store,
                &config.recovery,
                policy,
                metrics,
            )),
            probe: None,
            clock,
            config: config.recovery.clone(),
        }
    }

    pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// 依次执行每个扫描一次
    pub async fn run_all_once(&self, now: DateTime<Utc>) -> SchedulerResult<SupervisorReport> {
        let mut report = SupervisorReport::default();

        for outcome in self.detector.scan_heartbeats(now).await? {
            report.unreachable_workers.push(outcome.worker.id.clone());
            for recovered in outcome.recovered {
                if let TransitionOutcome::Applied { task, .. } = recovered {
                    if task.status == TaskStatus::DeadLetter {
                        report.heartbeat.dead_lettered.push(task.id);
                    } else {
                        report.heartbeat.requeued.push(task.id);
                    }
                }
            }
        }

        report.assignment = self.recovery.scan_assignment_timeouts(now).await?;
        report.task_timeout = self.recovery.scan_task_timeouts(now).await?;

        if let Some(probe) = &self.probe {
            report.health = Some(self.detector.scan_health(probe.as_ref(), now).await?);
        }

        Ok(report)
    }

    /// 启动所有周期扫描任务，收到关闭信号后退出
    pub fn start(&self, shutdown_rx: &broadcast::Receiver<()>) -> Vec<JoinHandle<()>> {
        info!("启动恢复监督器");
        let mut handles = Vec::new();

        {
            let detector = Arc::clone(&self.detector);
            let clock = Arc::clone(&self.clock);
            handles.push(tokio::spawn(run_scan_loop(
                "heartbeat",
                self.config.heartbeat_scan_interval(),
                shutdown_rx.resubscribe(),
                move || {
                    let detector = Arc::clone(&detector);
                    let now = clock.now();
                    async move { detector.scan_heartbeats(now).await.map(|outcomes| outcomes.len()) }
                },
            )));
        }

        {
            let recovery = Arc::clone(&self.recovery);
            let clock = Arc::clone(&self.clock);
            handles.push(tokio::spawn(run_scan_loop(
                "assignment_timeout",
                self.config.assignment_scan_interval(),
                shutdown_rx.resubscribe(),
                move || {
                    let recovery = Arc::clone(&recovery);
                    let now = clock.now();
                    async move {
                        recovery
                            .scan_assignment_timeouts(now)
                            .await
                            .map(|report| report.recovered())
                    }
                },
            )));
        }

        {
            let recovery = Arc::clone(&self.recovery);
            let clock = Arc::clone(&self.clock);
            handles.push(tokio::spawn(run_scan_loop(
                "task_timeout",
                self.config.task_timeout_scan_interval(),
                shutdown_rx.resubscribe(),
                move || {
                    let recovery = Arc::clone(&recovery);
                    let now = clock.now();
                    async move {
                        recovery
                            .scan_task_timeouts(now)
                            .await
                            .map(|report| report.recovered())
                    }
                },
            )));
        }

        match (&self.probe, self.config.health_probe_enabled) {
            (Some(probe), true) => {
                let detector = Arc::clone(&self.detector);
                let probe = Arc::clone(probe);
                let clock = Arc::clone(&self.clock);
                handles.push(tokio::spawn(run_scan_loop(
                    "health_probe",
                    self.config.health_probe_interval(),
                    shutdown_rx.resubscribe(),
                    move || {
                        let detector = Arc::clone(&detector);
                        let probe = Arc::clone(&probe);
                        let now = clock.now();
                        async move {
                            detector
                                .scan_health(probe.as_ref(), now)
                                .await
                                .map(|report| report.failed.len())
                        }
                    },
                )));
            }
            (None, true) => warn!("已启用健康探测，但未配置探测实现，跳过健康探测扫描"),
            _ => {}
        }

        handles
    }
}

/// 周期执行一个扫描，出错时记录日志并等待下一轮
async fn run_scan_loop<F, Fut>(
    name: &'static str,
    period: StdDuration,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut scan: F,
) where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = SchedulerResult<usize>> + Send,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match scan().await {
                    Ok(0) => {}
                    Ok(count) => debug!(scan = name, count, "扫描完成"),
                    Err(e) if e.is_degraded() => {
                        warn!(scan = name, "存储不可用，跳过本轮扫描: {}", e);
                    }
                    Err(e) => StructuredLogger::log_system_error("recovery_supervisor", name, &e),
                }
            }
            _ = shutdown_rx.recv() => {
                info!(scan = name, "恢复扫描收到关闭信号");
                break;
            }
        }
    }
}
