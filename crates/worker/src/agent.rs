use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use taskqueue_core::config::WorkerConfig;
use taskqueue_core::models::{TaskId, WorkerRegistration};
use taskqueue_core::traits::{HeartbeatAck, TaskQueueService};
use taskqueue_core::{SchedulerError, SchedulerResult};

use crate::components::{HeartbeatManager, TaskExecutionManager, WorkerLifecycle};
use crate::handler::TaskHandler;

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Worker代理构建器
pub struct WorkerAgentBuilder {
    service: Arc<dyn TaskQueueService>,
    handler: Arc<dyn TaskHandler>,
    config: WorkerConfig,
    shutdown_grace: Duration,
}

impl WorkerAgentBuilder {
    pub fn new(service: Arc<dyn TaskQueueService>, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            service,
            handler,
            config: WorkerConfig::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.config.worker_id = Some(worker_id.into());
        self
    }

    pub fn capacity(mut self, capacity: u32) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.config.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn heartbeat_interval_seconds(mut self, heartbeat_interval_seconds: u64) -> Self {
        self.config.heartbeat_interval_seconds = heartbeat_interval_seconds;
        self
    }

    /// 停止时等待运行中任务结束的最长时间
    pub fn shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    pub fn build(self) -> WorkerAgent {
        WorkerAgent {
            service: self.service,
            handler: self.handler,
            config: self.config,
            shutdown_grace: self.shutdown_grace,
            state: RwLock::new(None),
        }
    }
}

struct RunningState {
    execution: Arc<TaskExecutionManager>,
    heartbeat: Arc<HeartbeatManager>,
    lifecycle: Arc<WorkerLifecycle>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

/// Worker代理
///
/// 向调度器注册后运行两个循环：心跳循环上报运行中的任务并中止被取消或回收的任务，
/// 轮询循环按剩余容量认领任务并交给 [`TaskHandler`] 执行。
pub struct WorkerAgent {
    service: Arc<dyn TaskQueueService>,
    handler: Arc<dyn TaskHandler>,
    config: WorkerConfig,
    shutdown_grace: Duration,
    state: RwLock<Option<RunningState>>,
}

impl WorkerAgent {
    pub fn builder(
        service: Arc<dyn TaskQueueService>,
        handler: Arc<dyn TaskHandler>,
    ) -> WorkerAgentBuilder {
        WorkerAgentBuilder::new(service, handler)
    }

    fn registration(&self) -> WorkerRegistration {
        let hostname = self.config.hostname.clone().or_else(|| {
            hostname::get()
                .ok()
                .map(|name| name.to_string_lossy().into_owned())
        });
        let mut registration = WorkerRegistration::new(self.config.capacity)
            .with_capabilities(self.config.capabilities.iter().cloned());
        if let Some(worker_id) = &self.config.worker_id {
            registration = registration.with_id(worker_id.clone());
        }
        if let Some(hostname) = hostname {
            registration = registration.with_hostname(hostname);
        }
        registration
    }

    /// 注册并启动心跳与轮询循环，返回调度器确认的Worker ID
    pub async fn start(&self) -> SchedulerResult<String> {
        let mut state = self.state.write().await;
        if state.is_some() {
            return Err(SchedulerError::Internal("Worker代理已在运行".to_string()));
        }

        let registration = self.registration();
        let worker = self
            .service
            .register_worker(registration.clone())
            .await?;
        info!(
            "Worker {} 注册成功，容量 {}，能力 {:?}",
            worker.id, worker.capacity, worker.capabilities
        );

        let execution = Arc::new(TaskExecutionManager::new(
            worker.id.clone(),
            Arc::clone(&self.service),
            Arc::clone(&self.handler),
            worker.capacity as usize,
        ));
        let heartbeat = Arc::new(HeartbeatManager::new(
            Arc::clone(&self.service),
            Arc::clone(&execution),
            registration.with_id(worker.id.clone()),
            self.config.heartbeat_interval(),
        ));
        let lifecycle = Arc::new(WorkerLifecycle::new(
            Arc::clone(&self.service),
            Arc::clone(&execution),
            self.config.poll_interval(),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        let handles = vec![
            Arc::clone(&heartbeat).start_heartbeat_task(shutdown_tx.subscribe()),
            Arc::clone(&lifecycle).start_task_polling(shutdown_tx.subscribe()),
        ];

        *state = Some(RunningState {
            execution,
            heartbeat,
            lifecycle,
            shutdown_tx,
            handles,
        });
        info!("Worker代理 {} 已启动", worker.id);
        Ok(worker.id)
    }

    pub async fn worker_id(&self) -> Option<String> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.execution.worker_id().to_string())
    }

    pub async fn running_tasks(&self) -> Vec<TaskId> {
        match self.state.read().await.as_ref() {
            Some(state) => state.execution.running_task_ids().await,
            None => Vec::new(),
        }
    }

    /// 立即发送一次心跳，不等待下一个心跳周期
    pub async fn heartbeat_now(&self) -> SchedulerResult<HeartbeatAck> {
        let heartbeat = self
            .state
            .read()
            .await
            .as_ref()
            .map(|s| Arc::clone(&s.heartbeat))
            .ok_or_else(|| SchedulerError::Internal("Worker代理未启动".to_string()))?;
        heartbeat.send_heartbeat().await
    }

    /// 立即轮询一次，返回开始执行的任务数
    pub async fn poll_now(&self) -> SchedulerResult<usize> {
        let lifecycle = self
            .state
            .read()
            .await
            .as_ref()
            .map(|s| Arc::clone(&s.lifecycle))
            .ok_or_else(|| SchedulerError::Internal("Worker代理未启动".to_string()))?;
        lifecycle.poll_once().await
    }

    /// 优雅停止：先排空，不再认领新任务，等待运行中任务结束，超时后中止剩余任务
    pub async fn stop(&self) -> SchedulerResult<()> {
        let Some(state) = self.state.write().await.take() else {
            return Ok(());
        };
        let worker_id = state.execution.worker_id().to_string();
        info!("停止Worker代理: {}", worker_id);

        if let Err(e) = self.service.drain_worker(&worker_id).await {
            warn!("Worker {} 排空失败: {}", worker_id, e);
        }

        let _ = state.shutdown_tx.send(());
        for handle in state.handles {
            if let Err(e) = handle.await {
                error!("Worker {} 的后台循环异常退出: {}", worker_id, e);
            }
        }

        let deadline = Instant::now() + self.shutdown_grace;
        while state.execution.current_task_count().await > 0 {
            if Instant::now() >= deadline {
                let aborted = state.execution.abort_all().await;
                warn!(
                    "Worker {} 等待超时，中止 {} 个未完成的任务: {:?}",
                    worker_id,
                    aborted.len(),
                    aborted
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!("Worker代理 {} 已停止", worker_id);
        Ok(())
    }
}
