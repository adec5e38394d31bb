use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    observability::ObservabilityConfig,
    queue_retry::{QueueConfig, RetryConfig},
    recovery_worker::{RecoveryConfig, WorkerConfig},
    store::StoreConfig,
};

/// 环境变量前缀，层级分隔符为 `__`，例如 `TASKQUEUE__QUEUE__MAX_WAIT_SECONDS`
pub const ENV_PREFIX: &str = "TASKQUEUE";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub recovery: RecoveryConfig,
    pub worker: WorkerConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: TASKQUEUE__)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/taskqueue.toml",
                "taskqueue.toml",
                "/etc/taskqueue/config.toml",
            ];

            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> Result<()> {
        self.store.validate().context("存储配置验证失败")?;

        self.queue.validate().context("队列配置验证失败")?;

        self.retry.validate().context("重试配置验证失败")?;

        self.recovery.validate().context("恢复配置验证失败")?;

        self.worker.validate().context("Worker配置验证失败")?;

        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        if self.retry.timeout_ceiling_seconds < self.queue.default_timeout_seconds {
            return Err(anyhow::anyhow!(
                "超时上限 {} 秒不能小于默认任务超时 {} 秒",
                self.retry.timeout_ceiling_seconds,
                self.queue.default_timeout_seconds
            ));
        }

        Ok(())
    }
}
