use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use taskqueue_core::models::WorkerRegistration;
use taskqueue_core::traits::{HeartbeatAck, TaskQueueService};
use taskqueue_core::{SchedulerError, SchedulerResult};

use super::TaskExecutionManager;

pub struct HeartbeatManager {
    service: Arc<dyn TaskQueueService>,
    execution: Arc<TaskExecutionManager>,
    registration: WorkerRegistration,
    heartbeat_interval: Duration,
}

impl HeartbeatManager {
    pub fn new(
        service: Arc<dyn TaskQueueService>,
        execution: Arc<TaskExecutionManager>,
        registration: WorkerRegistration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            service,
            execution,
            registration,
            heartbeat_interval,
        }
    }

    /// 发送一次心跳，并中止调度器要求放弃的任务
    ///
    /// Worker已被标记为不可达时，它持有的任务已经被重新分配：本地全部中止后重新注册。
    pub async fn send_heartbeat(&self) -> SchedulerResult<HeartbeatAck> {
        let worker_id = self.execution.worker_id();
        let running = self.execution.running_task_ids().await;

        match self.service.heartbeat(worker_id, &running).await {
            Ok(ack) => {
                for task_id in ack.tasks_to_abort() {
                    self.execution.abort(*task_id).await;
                }
                debug!("Worker {} 心跳成功，运行中任务 {}", worker_id, running.len());
                Ok(ack)
            }
            Err(SchedulerError::WorkerUnavailable { reason, .. }) => {
                warn!("Worker {} 心跳被拒绝: {}，重新注册", worker_id, reason);
                let revoked = self.execution.abort_all().await;
                self.service.register_worker(self.registration.clone()).await?;
                info!("Worker {} 已重新注册", worker_id);
                Ok(HeartbeatAck {
                    cancelled: Vec::new(),
                    revoked,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub fn start_heartbeat_task(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let mut heartbeat_interval = interval(self.heartbeat_interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = heartbeat_interval.tick() => {
                        if let Err(e) = self.send_heartbeat().await {
                            error!("发送心跳失败: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("心跳任务收到关闭信号");
                        break;
                    }
                }
            }
        })
    }
}
