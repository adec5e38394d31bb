use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use taskqueue_core::config::AppConfig;
use taskqueue_core::models::{TaskPriority, TaskSubmission};
use taskqueue_core::traits::{Clock, QueueStore, SystemClock, TaskQueueService};
use taskqueue_core::ScoreFunction;
use taskqueue_dispatcher::{RecoverySupervisor, TaskQueueScheduler};
use taskqueue_infrastructure::{MetricsCollector, QueueStoreFactory};
use taskqueue_worker::{SimulatedHandler, WorkerAgent};

const DEMO_WORKERS: usize = 3;
const DEMO_TASKS: usize = 30;
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 只运行调度核心和恢复监督器
    Supervisor,
    /// 额外提交一批演示任务并运行本地Worker
    Demo,
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "supervisor" => Ok(AppMode::Supervisor),
            "demo" => Ok(AppMode::Demo),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {s}")),
        }
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    clock: Arc<dyn Clock>,
    scheduler: Arc<TaskQueueScheduler>,
    supervisor: RecoverySupervisor,
}

impl Application {
    /// 创建新的应用实例
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        Self::with_clock(config, mode, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(config: AppConfig, mode: AppMode, clock: Arc<dyn Clock>) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}，存储: {:?}", mode, config.store.backend);

        let store = QueueStoreFactory::create(
            &config.store,
            ScoreFunction::from_config(&config.queue),
        )
        .await
        .context("创建任务存储失败")?;
        store.ping().await.context("任务存储不可用")?;

        let metrics = Arc::new(MetricsCollector::new());
        let scheduler = Arc::new(TaskQueueScheduler::with_metrics(
            Arc::clone(&store),
            Arc::clone(&clock),
            &config,
            Arc::clone(&metrics),
        ));
        let supervisor = RecoverySupervisor::new(store, Arc::clone(&clock), metrics, &config);

        Ok(Self {
            config,
            mode,
            clock,
            scheduler,
            supervisor,
        })
    }

    pub fn scheduler(&self) -> Arc<TaskQueueScheduler> {
        Arc::clone(&self.scheduler)
    }

    /// 运行应用程序，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        // 冷启动时先处理上次运行遗留的超时任务和失联Worker
        let report = self
            .supervisor
            .run_all_once(self.clock.now())
            .await
            .context("启动恢复扫描失败")?;
        if report.recovered() > 0 || !report.unreachable_workers.is_empty() {
            info!(
                "启动恢复: 回收任务 {} 个，失联Worker {:?}",
                report.recovered(),
                report.unreachable_workers
            );
        }

        let mut handles = self.supervisor.start(&shutdown_rx);
        handles.push(self.start_stats_reporter(shutdown_rx.resubscribe()));

        let agents = match self.mode {
            AppMode::Supervisor => Vec::new(),
            AppMode::Demo => self.start_demo().await?,
        };

        let _ = shutdown_rx.recv().await;
        info!("应用程序收到关闭信号");

        for agent in &agents {
            if let Err(e) = agent.stop().await {
                error!("停止Worker代理失败: {}", e);
            }
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("后台任务异常退出: {}", e);
            }
        }

        let counters = self.scheduler.counters();
        info!(
            submitted = counters.submitted,
            completed = counters.completed,
            requeued = counters.requeued,
            dead_lettered = counters.dead_lettered,
            promotions_by_aging = counters.promotions_by_aging,
            "应用程序已停止"
        );
        Ok(())
    }

    async fn start_demo(&self) -> Result<Vec<WorkerAgent>> {
        let submitted = submit_demo_burst(self.scheduler.as_ref(), DEMO_TASKS).await?;
        info!("已提交 {} 个演示任务", submitted);

        let mut agents = Vec::with_capacity(DEMO_WORKERS);
        for i in 0..DEMO_WORKERS {
            let mut worker_config = self.config.worker.clone();
            worker_config.worker_id = Some(format!("demo-worker-{i}"));
            let agent = WorkerAgent::builder(self.scheduler(), Arc::new(SimulatedHandler))
                .config(worker_config)
                .build();
            agent.start().await.context("启动演示Worker失败")?;
            agents.push(agent);
        }
        Ok(agents)
    }

    fn start_stats_reporter(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let scheduler = self.scheduler();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match scheduler.queue_stats().await {
                            Ok(stats) => info!(
                                queued = stats.queued,
                                claimed = stats.claimed,
                                executing = stats.executing,
                                dead_letter = stats.dead_letter,
                                "队列状态"
                            ),
                            Err(e) => warn!("获取队列统计失败: {}", e),
                        }
                        if let Err(e) = scheduler.worker_stats().await {
                            warn!("获取Worker统计失败: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }
}

/// 提交一批混合优先级的演示任务，约一成任务始终失败，重试一次后进入死信队列
pub async fn submit_demo_burst(service: &dyn TaskQueueService, count: usize) -> Result<usize> {
    let mut submitted = 0;
    for i in 0..count {
        let (priority, duration_ms, fail) = {
            let mut rng = rand::rng();
            let priority = TaskPriority::ALL[rng.random_range(0..TaskPriority::ALL.len())];
            let duration_ms: u64 = rng.random_range(50..500);
            let fail = rng.random_bool(0.1);
            (priority, duration_ms, fail)
        };
        let mut submission = TaskSubmission::new(priority)
            .with_payload(json!({ "seq": i, "duration_ms": duration_ms }))
            .with_idempotency_key(format!("demo-{i}"));
        if fail {
            submission = submission
                .with_payload(json!({ "seq": i, "fail": "retriable" }))
                .with_max_retries(1);
        }

        let receipt = service
            .submit(submission)
            .await
            .with_context(|| format!("提交演示任务 {i} 失败"))?;
        if receipt.created {
            submitted += 1;
        }
    }
    Ok(submitted)
}
