use serde::{Deserialize, Serialize};

/// 存储后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

/// Store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub sqlite_url: String,
    pub connection_timeout_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sqlite_url: "sqlite://taskqueue.db?mode=rwc".to_string(),
            connection_timeout_seconds: 30,
        }
    }
}

impl StoreConfig {
    /// Validate store configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend == StoreBackend::Sqlite {
            if self.sqlite_url.is_empty() {
                return Err(anyhow::anyhow!("数据库URL不能为空"));
            }

            if !self.sqlite_url.starts_with("sqlite:") {
                return Err(anyhow::anyhow!("数据库URL必须是SQLite格式"));
            }
        }

        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }

        Ok(())
    }
}
