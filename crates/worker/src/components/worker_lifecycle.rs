use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use taskqueue_core::traits::TaskQueueService;
use taskqueue_core::SchedulerResult;

use super::TaskExecutionManager;

/// 轮询间隔的随机抖动比例，避免大量Worker同时轮询
const POLL_JITTER_RATIO: f64 = 0.2;

fn jittered(poll_interval: Duration) -> Duration {
    let max_jitter_ms = (poll_interval.as_millis() as f64 * POLL_JITTER_RATIO) as u64;
    if max_jitter_ms == 0 {
        return poll_interval;
    }
    poll_interval + Duration::from_millis(rand::rng().random_range(0..=max_jitter_ms))
}

/// 任务轮询循环
pub struct WorkerLifecycle {
    service: Arc<dyn TaskQueueService>,
    execution: Arc<TaskExecutionManager>,
    poll_interval: Duration,
}

impl WorkerLifecycle {
    pub fn new(
        service: Arc<dyn TaskQueueService>,
        execution: Arc<TaskExecutionManager>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            service,
            execution,
            poll_interval,
        }
    }

    /// 按剩余容量轮询一次，返回本次开始执行的任务数
    pub async fn poll_once(&self) -> SchedulerResult<usize> {
        let capacity = self.execution.available_capacity().await;
        if capacity == 0 {
            return Ok(0);
        }

        let tasks = self
            .service
            .poll(self.execution.worker_id(), capacity)
            .await?;
        let count = tasks.len();
        for task in tasks {
            self.execution.execute(task).await;
        }
        if count > 0 {
            debug!(
                "Worker {} 认领了 {} 个任务",
                self.execution.worker_id(),
                count
            );
        }
        Ok(count)
    }

    fn next_delay(&self) -> Duration {
        jittered(self.poll_interval)
    }

    pub fn start_task_polling(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                // 认领到任务后立即再次轮询，队列为空时才等待
                let delay = match self.poll_once().await {
                    Ok(count) if count > 0 => Duration::ZERO,
                    Ok(_) => self.next_delay(),
                    Err(e) => {
                        error!("任务轮询失败: {}", e);
                        self.next_delay()
                    }
                };

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.recv() => {
                        info!("任务轮询收到关闭信号");
                        break;
                    }
                }
            }
        })
    }
}
