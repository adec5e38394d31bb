use std::sync::Arc;

use taskqueue_core::config::{StoreBackend, StoreConfig};
use taskqueue_core::traits::QueueStore;
use taskqueue_core::{SchedulerResult, ScoreFunction};
use tracing::{debug, info};

use crate::database::SqliteQueueStore;
use crate::in_memory_store::InMemoryQueueStore;

pub struct QueueStoreFactory;

impl QueueStoreFactory {
    pub async fn create(
        config: &StoreConfig,
        scorer: ScoreFunction,
    ) -> SchedulerResult<Arc<dyn QueueStore>> {
        debug!("Creating queue store with backend: {:?}", config.backend);

        match config.backend {
            StoreBackend::Memory => {
                info!("使用内存队列存储，进程退出后数据不保留");
                Ok(Arc::new(InMemoryQueueStore::new(scorer)))
            }
            StoreBackend::Sqlite => {
                info!("Initializing SQLite queue store");
                let store = SqliteQueueStore::connect(config, scorer).await?;
                Ok(Arc::new(store))
            }
        }
    }
}
